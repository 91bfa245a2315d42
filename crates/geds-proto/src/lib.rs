/// Wire types and service stubs for the `geds.rpc` package. The generated
/// sources are committed; regenerate with `prost-build`/`tonic-build` when
/// the schema changes.
pub mod rpc {
    include!("gen/geds.rpc.rs");
}

mod object;
pub use object::{Object, ObjectId, ObjectInfo};

use geds_util::{Error, Result};

impl rpc::StatusResponse {
    pub fn ok() -> Self {
        Self {
            code: rpc::StatusCode::Ok as i32,
            message: String::new(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code() as i32,
            message: err.message().to_string(),
        }
    }

    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn into_result(self) -> Result<()> {
        if self.code == rpc::StatusCode::Ok as i32 {
            Ok(())
        } else {
            Err(Error::from_code(tonic::Code::from(self.code), self.message))
        }
    }
}

/// Unwrap a response embedding an optional `error` status.
pub fn check_error(error: Option<rpc::StatusResponse>) -> Result<()> {
    match error {
        None => Ok(()),
        Some(status) => status.into_result(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_round_trip() {
        assert!(rpc::StatusResponse::ok().into_result().is_ok());

        let err = Error::AlreadyExists("node n1 was already registered".to_string());
        let resp = rpc::StatusResponse::from_error(&err);
        assert_eq!(resp.code(), rpc::StatusCode::AlreadyExists);
        match resp.into_result() {
            Err(Error::AlreadyExists(msg)) => {
                assert_eq!(msg, "node n1 was already registered")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn status_codes_mirror_grpc_codes() {
        assert_eq!(rpc::StatusCode::Ok as i32, 0);
        assert_eq!(rpc::StatusCode::NotFound as i32, 5);
        assert_eq!(rpc::StatusCode::AlreadyExists as i32, 6);
        assert_eq!(rpc::StatusCode::PermissionDenied as i32, 7);
        assert_eq!(rpc::StatusCode::FailedPrecondition as i32, 9);
        assert_eq!(rpc::StatusCode::Unavailable as i32, 14);
        assert_eq!(rpc::StatusCode::Unauthenticated as i32, 16);
    }
}
