//! # Operator Console
//!
//! Key-level seam to the platform console plus the three input routines
//! the state machine needs: device pick, recovery code line, and the
//! confirmation before a reset.

use log::debug;

use crate::error::Result;

/// Decoded key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Escape,
    Other,
}

/// Platform console
pub trait Console {
    /// Print text verbatim
    fn print(&mut self, text: &str) -> Result<()>;

    /// Block until a key is pressed
    fn wait_key(&mut self) -> Result<Key>;

    /// Return a pending key, if any, without blocking
    fn poll_key(&mut self) -> Result<Option<Key>>;
}

impl<C: Console + ?Sized> Console for &mut C {
    fn print(&mut self, text: &str) -> Result<()> {
        (**self).print(text)
    }

    fn wait_key(&mut self) -> Result<Key> {
        (**self).wait_key()
    }

    fn poll_key(&mut self) -> Result<Option<Key>> {
        (**self).poll_key()
    }
}

/// Characters accepted in a recovery code line
fn is_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Read exactly `expected_len` code characters terminated by Enter.
///
/// Accepted characters are echoed, Backspace erases, anything else is
/// ignored. Enter with the wrong length restarts the line.
pub fn read_code_line<C: Console>(console: &mut C, expected_len: usize) -> Result<String> {
    let mut line = String::with_capacity(expected_len);
    loop {
        match console.wait_key()? {
            Key::Enter if line.len() == expected_len => {
                console.print("\n")?;
                return Ok(line);
            }
            Key::Enter => {
                console.print(&format!(
                    "\nInput must be exactly {} characters. Try again: ",
                    expected_len
                ))?;
                line.clear();
            }
            Key::Backspace => {
                if line.pop().is_some() {
                    console.print("\u{8} \u{8}")?;
                }
            }
            Key::Char(c) if is_code_char(c) && line.len() < expected_len => {
                line.push(c);
                let mut echo = [0u8; 4];
                console.print(c.encode_utf8(&mut echo))?;
            }
            other => debug!("ignoring key {:?}", other),
        }
    }
}

/// Single keystroke device pick; returns the zero-based index
pub fn select_device<C: Console>(console: &mut C, count: usize) -> Result<Option<usize>> {
    let count = count.min(9);
    match console.wait_key()? {
        Key::Char(c @ '1'..='9') => {
            let picked = (c as u8 - b'0') as usize;
            if picked <= count {
                console.print(&format!("{}\n", picked))?;
                return Ok(Some(picked - 1));
            }
        }
        other => debug!("ignoring selection key {:?}", other),
    }
    console.print("Invalid selection.\n")?;
    Ok(None)
}

/// Block until Enter is pressed
pub fn wait_for_enter<C: Console>(console: &mut C) -> Result<()> {
    loop {
        if console.wait_key()? == Key::Enter {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sim::ScriptedConsole;

    #[test]
    fn test_read_code_line_accepts_exact_length() {
        let mut console = ScriptedConsole::from_text("ab-1\n");
        assert_eq!(read_code_line(&mut console, 4).unwrap(), "ab-1");
        assert_eq!(console.output(), "ab-1\n");
    }

    #[test]
    fn test_read_code_line_filters_and_erases() {
        let mut console = ScriptedConsole::new(vec![
            Key::Char('a'),
            Key::Char('!'),
            Key::Char('b'),
            Key::Backspace,
            Key::Escape,
            Key::Char('c'),
            Key::Enter,
        ]);
        assert_eq!(read_code_line(&mut console, 2).unwrap(), "ac");
    }

    #[test]
    fn test_read_code_line_restarts_on_short_enter() {
        let mut console = ScriptedConsole::from_text("a\nxy\n");
        assert_eq!(read_code_line(&mut console, 2).unwrap(), "xy");
        assert!(console.output().contains("exactly 2 characters"));
    }

    #[test]
    fn test_read_code_line_caps_length() {
        let mut console = ScriptedConsole::from_text("abcd\n");
        assert_eq!(read_code_line(&mut console, 3).unwrap(), "abc");
    }

    #[test]
    fn test_exhausted_script_is_console_error() {
        let mut console = ScriptedConsole::from_text("ab");
        assert!(matches!(read_code_line(&mut console, 4), Err(Error::Console(_))));
    }

    #[test]
    fn test_select_device_range() {
        let mut console = ScriptedConsole::from_text("2");
        assert_eq!(select_device(&mut console, 3).unwrap(), Some(1));

        let mut console = ScriptedConsole::from_text("4");
        assert_eq!(select_device(&mut console, 3).unwrap(), None);
        assert!(console.output().contains("Invalid selection"));

        let mut console = ScriptedConsole::from_text("0");
        assert_eq!(select_device(&mut console, 3).unwrap(), None);
    }

    #[test]
    fn test_wait_for_enter_skips_other_keys() {
        let mut console = ScriptedConsole::from_text("xy\n");
        wait_for_enter(&mut console).unwrap();
        assert_eq!(console.remaining(), 0);
    }
}
