//! Hello frame exchanged right after a link is established.
//!
//! One JSON object terminated by `\n`, e.g. `{"role":"peer","name":"driver-a"}`.

use std::io::{self, Read, Write};

use gridlink_core::{ChannelRole, GridError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_HELLO_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub role: ChannelRole,
    pub name: String,
}

impl Hello {
    pub fn peer(name: impl Into<String>) -> Self {
        Self {
            role: ChannelRole::Peer,
            name: name.into(),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self {
            role: ChannelRole::Node,
            name: name.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HelloError {
    #[error("hello io: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed before hello")]
    Closed,
    #[error("hello exceeds {} bytes", MAX_HELLO_BYTES)]
    TooLong,
    #[error("malformed hello: {0}")]
    Malformed(String),
}

impl From<HelloError> for GridError {
    fn from(err: HelloError) -> Self {
        match err {
            HelloError::Io(io) => GridError::Io(io),
            other => GridError::Protocol(other.to_string()),
        }
    }
}

pub fn write_hello<W: Write>(writer: &mut W, hello: &Hello) -> Result<(), HelloError> {
    let mut line =
        serde_json::to_vec(hello).map_err(|err| HelloError::Malformed(err.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one hello line.
///
/// Reads byte by byte so nothing past the newline is consumed from the link.
pub fn read_hello<R: Read>(reader: &mut R) -> Result<Hello, HelloError> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0_u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(HelloError::Closed),
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                if line.len() >= MAX_HELLO_BYTES {
                    return Err(HelloError::TooLong);
                }
                line.push(byte[0]);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(HelloError::Io(err)),
        }
    }
    serde_json::from_slice(&line).map_err(|err| HelloError::Malformed(err.to_string()))
}
