//! In-memory driving of a whole connection.

use std::{io, sync::Arc};

use amqpframe::{
    EngineConfig,
    broker::Broker,
    codec::{AmqpCodec, Inbound, Outbound},
    connection::Connection,
};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio_util::codec::{Decoder, Encoder};

const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Run a connection against `broker`, write each chunk of `input` to it in
/// order, shut down the client half and return every byte the connection
/// wrote back before it closed.
///
/// Protocol errors end the connection like they would on a socket; only
/// transport failures surface as an `io::Error`.
///
/// # Errors
///
/// Returns an error if writing to or reading from the duplex stream fails.
pub async fn drive_connection(
    broker: Arc<dyn Broker>,
    config: EngineConfig,
    input: Vec<Vec<u8>>,
) -> io::Result<Vec<u8>> {
    let (mut client, server) = duplex(DEFAULT_CAPACITY);
    let connection = Connection::new(server, broker, Arc::new(config));

    let server_fut = async {
        // The outcome is visible in the bytes written back.
        let _ = connection.run().await;
        io::Result::Ok(())
    };
    let client_fut = async {
        for chunk in &input {
            client.write_all(chunk).await?;
        }
        client.shutdown().await?;
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await?;
        io::Result::Ok(buf)
    };

    let ((), buf) = tokio::try_join!(server_fut, client_fut)?;
    Ok(buf)
}

/// Encode `units` with a fresh codec, one buffer per unit.
///
/// # Errors
///
/// Returns an error if a unit cannot be encoded.
pub fn encode_units(units: impl IntoIterator<Item = Outbound>) -> io::Result<Vec<Vec<u8>>> {
    let mut codec = AmqpCodec::default();
    units
        .into_iter()
        .map(|unit| {
            let mut buf = BytesMut::new();
            codec
                .encode(unit, &mut buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            Ok(buf.to_vec())
        })
        .collect()
}

/// Decode every unit in `bytes`, switching back to header mode before each
/// unit listed in `headers_at`.
///
/// # Errors
///
/// Returns an error if the bytes are malformed or end mid-unit.
pub fn decode_all(bytes: &[u8], headers_at: &[usize]) -> io::Result<Vec<Inbound>> {
    let mut codec = AmqpCodec::default();
    let mut buf = BytesMut::from(bytes);
    let mut units = Vec::new();
    loop {
        if headers_at.contains(&units.len()) {
            codec.expect_header();
        }
        match codec
            .decode_eof(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        {
            Some(unit) => units.push(unit),
            None => return Ok(units),
        }
    }
}
