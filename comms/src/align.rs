// Primitive number types whose alignment is at least 8 bytes, so a receive buffer made of
// them can be viewed as a `[f64]` payload without copying.
pub trait Align8: bytemuck::Pod {}

impl Align8 for u64 {}
impl Align8 for i64 {}
impl Align8 for f64 {}
