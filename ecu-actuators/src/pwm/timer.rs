/// One-shot compare facility of a free-running hardware timer.
///
/// `now` is a monotonic tick counter that wraps at `u32::MAX`. The compare
/// interrupt fires once when the counter reaches the armed tick.
pub trait CompareTimer {
    fn now(&self) -> u32;

    fn arm_compare_at(&mut self, tick: u32);

    fn enable_interrupt(&mut self);

    fn disable_interrupt(&mut self);
}
