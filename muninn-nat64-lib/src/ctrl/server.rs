//! The control-plane listener: one Unix socket, one task per client.

use std::path::Path;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::codec::{read_frame, write_frame};
use super::handler::CtrlHandler;
use super::message::Request;
use crate::error::Result;

/// Binds the socket and serves until the task is dropped. The stale
/// socket file from an unclean shutdown is swept first.
pub async fn run(socket_path: &Path, handler: Arc<CtrlHandler>) -> Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(socket = %socket_path.display(), "control plane listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(serve_client(stream, handler));
            }
            Err(err) => {
                warn!(%err, "control accept failed");
            }
        }
    }
}

async fn serve_client(mut stream: UnixStream, handler: Arc<CtrlHandler>) {
    loop {
        let request: Request = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                debug!(%err, "dropping control client");
                return;
            }
        };

        let response = handler.handle(&request);
        if let Err(err) = write_frame(&mut stream, &response).await {
            debug!(%err, "control client went away mid-response");
            return;
        }
    }
}
