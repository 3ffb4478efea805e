pub mod request;
pub mod response;

pub use request::{Body, BodyReader, Method, Params, Request};
pub use response::Response;

/// Per-request state threaded through the middleware chain.
#[derive(Debug)]
pub struct Context {
    pub req: Request,
    pub res: Response,
}

impl Context {
    pub fn new(req: Request) -> Self {
        Self {
            req,
            res: Response::default(),
        }
    }
}
