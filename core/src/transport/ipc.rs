//! IPC transport: a unix domain socket serving one stream codec per
//! accepted connection, subscriptions on.
//!
//! Binding cleans up stale socket files left behind by a crashed process,
//! but refuses paths another live server is still answering on.

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
	codec::StreamCodec,
	server::{ServeOptions, Server},
	types::IpcConfig,
	utils::spawn_in_span,
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// A bound IPC endpoint. Dropping the handle leaves the listener running;
/// call [`IpcEndpoint::stop`] for an orderly teardown.
#[derive(Debug)]
pub struct IpcEndpoint {
	path: PathBuf,
	cancel: CancellationToken,
	handle: tokio::task::JoinHandle<()>,
}

impl IpcEndpoint {
	/// Binds the socket path and starts accepting connections.
	pub fn bind(server: Arc<Server>, config: IpcConfig) -> io::Result<IpcEndpoint> {
		cleanup_stale_socket(&config.path)?;
		let listener = UnixListener::bind(&config.path)?;
		info!(path = %config.path.display(), "IPC endpoint ready");

		let cancel = CancellationToken::new();
		let handle = spawn_in_span(accept_loop(
			listener,
			server,
			cancel.clone(),
			config.path.clone(),
		));

		Ok(IpcEndpoint {
			path: config.path,
			cancel,
			handle,
		})
	}

	pub fn path(&self) -> &PathBuf {
		&self.path
	}

	/// Stops accepting and removes the socket file.
	pub async fn stop(self) {
		self.cancel.cancel();
		let _ = self.handle.await;
	}
}

async fn accept_loop(
	listener: UnixListener,
	server: Arc<Server>,
	cancel: CancellationToken,
	path: PathBuf,
) {
	let server_cancel = server.cancel_token();
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			_ = server_cancel.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok((stream, _)) => {
					let codec = Arc::new(StreamCodec::new(
						stream,
						server.limits().max_request_len,
						"ipc",
					));
					let server = server.clone();
					spawn_in_span(async move {
						server.serve_codec(codec, ServeOptions::multi_shot()).await;
					});
				},
				Err(error) => {
					warn!(%error, "IPC accept failed");
					tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
				},
			},
		}
	}

	if let Err(error) = std::fs::remove_file(&path) {
		if error.kind() != io::ErrorKind::NotFound {
			warn!(%error, path = %path.display(), "failed to remove IPC socket file");
		}
	}
}

/// Distinguishes a leftover socket file from one a live server still owns:
/// a refused connect means the previous owner is gone and the file can go.
fn cleanup_stale_socket(path: &PathBuf) -> io::Result<()> {
	use std::os::unix::fs::FileTypeExt;

	let metadata = match std::fs::symlink_metadata(path) {
		Ok(metadata) => metadata,
		Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
		Err(error) => return Err(error),
	};

	if !metadata.file_type().is_socket() {
		return Err(io::Error::new(
			io::ErrorKind::AddrInUse,
			format!("{} exists and is not a socket", path.display()),
		));
	}

	match std::os::unix::net::UnixStream::connect(path) {
		Ok(_) => Err(io::Error::new(
			io::ErrorKind::AddrInUse,
			format!("{} is in use by another server", path.display()),
		)),
		Err(error)
			if error.kind() == io::ErrorKind::ConnectionRefused
				|| error.kind() == io::ErrorKind::NotFound =>
		{
			std::fs::remove_file(path)
		},
		Err(error) => Err(error),
	}
}
