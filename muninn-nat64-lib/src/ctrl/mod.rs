mod codec;
mod handler;
mod message;
mod server;

pub use codec::{read_frame, write_frame, MAX_FRAME_LEN};
pub use handler::CtrlHandler;
pub use server::run as run_server;
pub use message::{
    Request, RequestHeader, RequestOp, Response, ResponsePayload, FLAG_DONE, MAGIC,
};
