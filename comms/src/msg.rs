use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

/// Size of the fixed part of a data frame: kind, op and sequence number.
/// It is a multiple of 8 so the values that follow stay aligned for `f64`.
const DATA_PREFIX_SIZE: usize = HEADER_SIZE * 2 + size_of::<u64>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const CONTRIBUTE_KIND: Header = 2;
const REDUCED_KIND: Header = 3;

/// The elementwise reduction applied by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    fn code(self) -> u32 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Mean => 1,
            ReduceOp::Max => 2,
            ReduceOp::Min => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ReduceOp::Sum,
            1 => ReduceOp::Mean,
            2 => ReduceOp::Max,
            3 => ReduceOp::Min,
            _ => return None,
        })
    }
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A rank's local values for collective number `seq`.
    Contribute {
        seq: u64,
        op: ReduceOp,
        values: &'a [f64],
    },
    /// The folded values for collective number `seq`, sent back by the hub.
    Reduced {
        seq: u64,
        op: ReduceOp,
        values: &'a [f64],
    },
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Welcome { world_size: usize },
    Abort { rank: usize, reason: String },
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn invalid<T>(detail: String) -> io::Result<T> {
        Err(io::Error::new(io::ErrorKind::InvalidData, detail))
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, seq, op, values) = match payload {
                    Payload::Contribute { seq, op, values } => (CONTRIBUTE_KIND, seq, op, values),
                    Payload::Reduced { seq, op, values } => (REDUCED_KIND, seq, op, values),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                buf.extend_from_slice(&op.code().to_be_bytes());
                buf.extend_from_slice(&seq.to_be_bytes());
                Some(bytemuck::cast_slice(*values))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::invalid(format!(
                "the given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            ));
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        match read_u32(kind_buf, 0) {
            ERR_KIND => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ (CONTRIBUTE_KIND | REDUCED_KIND) => {
                if buf.len() < DATA_PREFIX_SIZE {
                    return Self::invalid(format!(
                        "data frame of {} bytes is shorter than its {DATA_PREFIX_SIZE} bytes prefix",
                        buf.len()
                    ));
                }

                let code = read_u32(buf, HEADER_SIZE);
                let Some(op) = ReduceOp::from_code(code) else {
                    return Self::invalid(format!("received an invalid reduce op {code}"));
                };

                let seq = read_u64(buf, HEADER_SIZE * 2);
                let values = bytemuck::try_cast_slice(&buf[DATA_PREFIX_SIZE..])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}")))?;

                let payload = match kind {
                    CONTRIBUTE_KIND => Payload::Contribute { seq, op, values },
                    _ => Payload::Reduced { seq, op, values },
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid(format!("received an invalid kind {kind}")),
        }
    }
}
