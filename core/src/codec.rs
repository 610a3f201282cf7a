//! Connection codecs.
//!
//! A codec frames one JSON-RPC message stream over some native connection.
//! The dispatcher only ever sees [`ServerCodec`]; transports pick the
//! implementation that matches their connection shape:
//!
//! * [`StreamCodec`] — newline-delimited JSON over any byte-duplex stream
//!   (IPC sockets, duplex pipes in tests).
//! * [`ChannelCodec`] — one transport message per JSON value (WebSocket
//!   frames, gRPC stream entries).
//! * [`BufferedCodec`] — a single request body in, buffered output out
//!   (HTTP, unary gRPC).

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
	sync::{mpsc, Mutex as AsyncMutex},
};
use tokio_util::{
	codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
	sync::CancellationToken,
};

use crate::error::CodecError;

/// Bidirectional JSON message stream, one frame per JSON value.
///
/// `recv` is only ever driven from the connection's serve loop; `send` is
/// internally mutually exclusive so dispatcher workers and notifiers can
/// write concurrently.
#[async_trait]
pub trait ServerCodec: Send + Sync {
	/// Reads the next message. [`CodecError::Closed`] ends the serve loop
	/// gracefully; [`CodecError::Oversized`] must terminate the codec.
	async fn recv(&self) -> Result<String, CodecError>;

	/// Writes one framed JSON value.
	async fn send(&self, frame: String) -> Result<(), CodecError>;

	/// Tears the codec down. Idempotent; pending reads unblock.
	fn close(&self);

	/// Fires once the peer or the local side has torn down the transport.
	fn closed(&self) -> CancellationToken;

	/// Human-readable peer label for logs.
	fn remote(&self) -> String;
}

/// Newline-delimited JSON over a byte-duplex stream.
pub struct StreamCodec<S> {
	reader: AsyncMutex<FramedRead<ReadHalf<S>, LinesCodec>>,
	writer: AsyncMutex<FramedWrite<WriteHalf<S>, LinesCodec>>,
	limit: usize,
	closed: CancellationToken,
	remote: String,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamCodec<S> {
	pub fn new(stream: S, limit: usize, remote: impl Into<String>) -> Self {
		let (read_half, write_half) = tokio::io::split(stream);
		StreamCodec {
			reader: AsyncMutex::new(FramedRead::new(
				read_half,
				LinesCodec::new_with_max_length(limit),
			)),
			writer: AsyncMutex::new(FramedWrite::new(write_half, LinesCodec::new())),
			limit,
			closed: CancellationToken::new(),
			remote: remote.into(),
		}
	}
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> ServerCodec for StreamCodec<S> {
	async fn recv(&self) -> Result<String, CodecError> {
		let mut reader = self.reader.lock().await;
		tokio::select! {
			_ = self.closed.cancelled() => Err(CodecError::Closed),
			frame = reader.next() => match frame {
				None => Err(CodecError::Closed),
				Some(Ok(line)) => Ok(line),
				Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
					Err(CodecError::Oversized { limit: self.limit })
				},
				Some(Err(LinesCodecError::Io(e))) => Err(CodecError::Io(e)),
			},
		}
	}

	async fn send(&self, frame: String) -> Result<(), CodecError> {
		if self.closed.is_cancelled() {
			return Err(CodecError::Closed);
		}
		let mut writer = self.writer.lock().await;
		writer.send(frame).await.map_err(|e| match e {
			LinesCodecError::Io(e) => CodecError::Io(e),
			LinesCodecError::MaxLineLengthExceeded => CodecError::Oversized { limit: self.limit },
		})
	}

	fn close(&self) {
		self.closed.cancel();
	}

	fn closed(&self) -> CancellationToken {
		self.closed.clone()
	}

	fn remote(&self) -> String {
		self.remote.clone()
	}
}

/// Message-per-frame codec backed by channels; the owning transport pumps
/// the channels from and to its native connection.
pub struct ChannelCodec {
	incoming: AsyncMutex<mpsc::Receiver<String>>,
	outgoing: mpsc::Sender<String>,
	limit: usize,
	closed: CancellationToken,
	remote: String,
}

impl ChannelCodec {
	/// Returns the codec plus the transport-side handles: a sender feeding
	/// incoming frames and a receiver draining outgoing ones.
	pub fn new(
		limit: usize,
		buffer: usize,
		remote: impl Into<String>,
	) -> (Self, mpsc::Sender<String>, mpsc::Receiver<String>) {
		let (in_tx, in_rx) = mpsc::channel(buffer);
		let (out_tx, out_rx) = mpsc::channel(buffer);
		let codec = ChannelCodec {
			incoming: AsyncMutex::new(in_rx),
			outgoing: out_tx,
			limit,
			closed: CancellationToken::new(),
			remote: remote.into(),
		};
		(codec, in_tx, out_rx)
	}
}

#[async_trait]
impl ServerCodec for ChannelCodec {
	async fn recv(&self) -> Result<String, CodecError> {
		let mut incoming = self.incoming.lock().await;
		tokio::select! {
			_ = self.closed.cancelled() => Err(CodecError::Closed),
			frame = incoming.recv() => match frame {
				None => Err(CodecError::Closed),
				Some(frame) if frame.len() > self.limit => {
					Err(CodecError::Oversized { limit: self.limit })
				},
				Some(frame) => Ok(frame),
			},
		}
	}

	async fn send(&self, frame: String) -> Result<(), CodecError> {
		if self.closed.is_cancelled() {
			return Err(CodecError::Closed);
		}
		self.outgoing
			.send(frame)
			.await
			.map_err(|_| CodecError::Closed)
	}

	fn close(&self) {
		self.closed.cancel();
	}

	fn closed(&self) -> CancellationToken {
		self.closed.clone()
	}

	fn remote(&self) -> String {
		self.remote.clone()
	}
}

/// Single-shot codec: the whole request body is the one incoming message,
/// written responses accumulate for the transport to collect.
pub struct BufferedCodec {
	request: StdMutex<Option<String>>,
	output: StdMutex<Vec<String>>,
	closed: CancellationToken,
	remote: String,
}

impl BufferedCodec {
	pub fn new(body: String, remote: impl Into<String>) -> Self {
		BufferedCodec {
			request: StdMutex::new(Some(body)),
			output: StdMutex::new(Vec::new()),
			closed: CancellationToken::new(),
			remote: remote.into(),
		}
	}

	/// The buffered response body, if any was written.
	pub fn take_output(&self) -> Option<String> {
		let mut output = self.output.lock().expect("output lock poisoned");
		if output.is_empty() {
			None
		} else {
			Some(output.remove(0))
		}
	}
}

#[async_trait]
impl ServerCodec for BufferedCodec {
	async fn recv(&self) -> Result<String, CodecError> {
		let taken = self.request.lock().expect("request lock poisoned").take();
		taken.ok_or(CodecError::Closed)
	}

	async fn send(&self, frame: String) -> Result<(), CodecError> {
		if self.closed.is_cancelled() {
			return Err(CodecError::Closed);
		}
		self.output.lock().expect("output lock poisoned").push(frame);
		Ok(())
	}

	fn close(&self) {
		self.closed.cancel();
	}

	fn closed(&self) -> CancellationToken {
		self.closed.clone()
	}

	fn remote(&self) -> String {
		self.remote.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncWriteExt;

	#[tokio::test]
	async fn stream_codec_round_trip() {
		let (server_side, mut client_side) = tokio::io::duplex(4096);
		let codec = StreamCodec::new(server_side, 1024, "test");

		client_side.write_all(b"{\"x\":1}\n").await.unwrap();
		assert_eq!(codec.recv().await.unwrap(), "{\"x\":1}");

		codec.send("{\"y\":2}".to_string()).await.unwrap();
		let mut buf = vec![0u8; 16];
		let n = tokio::io::AsyncReadExt::read(&mut client_side, &mut buf)
			.await
			.unwrap();
		assert_eq!(&buf[..n], b"{\"y\":2}\n");
	}

	#[tokio::test]
	async fn stream_codec_enforces_size_limit() {
		let (server_side, mut client_side) = tokio::io::duplex(4096);
		let codec = StreamCodec::new(server_side, 8, "test");

		client_side.write_all(b"0123456789abcdef\n").await.unwrap();
		assert!(matches!(
			codec.recv().await,
			Err(CodecError::Oversized { limit: 8 })
		));
	}

	#[tokio::test]
	async fn stream_codec_close_unblocks_reader() {
		let (server_side, _client_side) = tokio::io::duplex(64);
		let codec = std::sync::Arc::new(StreamCodec::new(server_side, 1024, "test"));

		let reader = codec.clone();
		let handle = tokio::spawn(async move { reader.recv().await });
		codec.close();
		codec.close();
		assert!(matches!(handle.await.unwrap(), Err(CodecError::Closed)));
	}

	#[tokio::test]
	async fn channel_codec_round_trip() {
		let (codec, in_tx, mut out_rx) = ChannelCodec::new(1024, 8, "test");
		in_tx.send("{\"a\":1}".to_string()).await.unwrap();
		assert_eq!(codec.recv().await.unwrap(), "{\"a\":1}");

		codec.send("{\"b\":2}".to_string()).await.unwrap();
		assert_eq!(out_rx.recv().await.unwrap(), "{\"b\":2}");
	}

	#[tokio::test]
	async fn buffered_codec_is_single_shot() {
		let codec = BufferedCodec::new("{\"a\":1}".to_string(), "test");
		assert_eq!(codec.recv().await.unwrap(), "{\"a\":1}");
		assert!(matches!(codec.recv().await, Err(CodecError::Closed)));

		codec.send("out".to_string()).await.unwrap();
		assert_eq!(codec.take_output().as_deref(), Some("out"));
		assert!(codec.take_output().is_none());
	}
}
