//! Power control and delays.

use core::time::Duration;

/// Platform services used by the state machine
pub trait Platform {
    /// Blocking delay
    fn stall(&mut self, duration: Duration);

    /// Warm reset; on hardware this does not return
    fn warm_reset(&mut self);

    /// Power off; on hardware this does not return
    fn shutdown(&mut self);
}

impl<P: Platform + ?Sized> Platform for &mut P {
    fn stall(&mut self, duration: Duration) {
        (**self).stall(duration)
    }

    fn warm_reset(&mut self) {
        (**self).warm_reset()
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
