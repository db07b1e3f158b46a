use std::io;

/// Reads a message out of a received frame.
pub trait Deserialize<'a>: Sized {
    /// Deserializes a frame, the result may borrow from `buf`.
    ///
    /// # Arguments
    /// * `buf` - The frame body, 8-byte aligned.
    ///
    /// # Returns
    /// The decoded message or an `InvalidData` io error.
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
