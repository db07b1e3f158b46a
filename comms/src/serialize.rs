/// Writes a message into an outgoing buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer holding the message header and any owned encoding.
    ///
    /// # Returns
    /// An optional borrowed tail that is written right after `buf` without being copied.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
