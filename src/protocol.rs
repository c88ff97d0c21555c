//! Native messaging framing: `[u32 length, native endian][JSON body]`.

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Browsers refuse host messages above 1 MiB; their own messages may be larger.
pub const MAX_HOST_MESSAGE: usize = 1024 * 1024;

/// Largest message a browser sends to a native host.
pub const MAX_BROWSER_MESSAGE: usize = 64 * 1024 * 1024;

pub fn read_message<R: Read>(mut reader: R) -> io::Result<serde_json::Value> {
    let len = reader.read_u32::<NativeEndian>()?;
    if len as usize > MAX_BROWSER_MESSAGE {
        // Skip the body so the next frame still starts on a length prefix.
        io::copy(&mut reader.by_ref().take(u64::from(len)), &mut io::sink())?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("incoming message of {len} bytes exceeds the native messaging limit"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;

    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_message<W: Write>(mut writer: W, msg: &serde_json::Value) -> io::Result<()> {
    let msg_str = serde_json::to_string(msg)?;
    if msg_str.len() > MAX_HOST_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {} bytes exceeds the native messaging limit", msg_str.len()),
        ));
    }

    writer.write_u32::<NativeEndian>(msg_str.len() as u32)?;
    writer.write_all(msg_str.as_bytes())?;
    writer.flush()
}
