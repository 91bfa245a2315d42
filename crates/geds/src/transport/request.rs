//! The ASCII request line and the binary response header of the simple data
//! plane.
//!
//! Requests look like `GET bucket/key\nRANGE <offset> <length>` followed by a
//! NUL terminator on the wire. The response is a 12-byte little-endian header
//! `{ i32 status; u64 length }` with either payload bytes or a UTF-8 error
//! message behind it.

use geds_util::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;

pub const RESPONSE_HEADER_SIZE: usize = 12;

lazy_static! {
    static ref GET_REQUEST: Regex =
        Regex::new(r"^GET ([a-z\d][a-z\d.\-]+[a-z\d])/(.+)\nRANGE (\d+) (\d+)$")
            .expect("request pattern is valid");
}

pub fn create_get_request(bucket: &str, key: &str, position: u64, length: u64) -> String {
    format!("GET {bucket}/{key}\nRANGE {position} {length}")
}

pub fn parse_get_request(request: &str) -> Result<(String, String, u64, u64)> {
    let captures = GET_REQUEST
        .captures(request)
        .ok_or_else(|| Error::InvalidArgument(format!("unable to parse '{request}'")))?;
    let bucket = captures[1].to_string();
    let key = captures[2].to_string();
    let position: u64 = captures[3]
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid offset in '{request}'")))?;
    let length: u64 = captures[4]
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid length in '{request}'")))?;
    Ok((bucket, key, position, length))
}

/// Response header of the simple plane. On error, `length` is the size of the
/// UTF-8 message that follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub status_code: i32,
    pub length: u64,
}

impl Response {
    pub fn ok(length: u64) -> Self {
        Self {
            status_code: 0,
            length,
        }
    }

    pub fn error(err: &Error) -> Self {
        Self {
            status_code: err.code() as i32,
            length: err.message().len() as u64,
        }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        buf[..4].copy_from_slice(&self.status_code.to_le_bytes());
        buf[4..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; RESPONSE_HEADER_SIZE]) -> Self {
        Self {
            status_code: i32::from_le_bytes(buf[..4].try_into().expect("4 bytes")),
            length: u64::from_le_bytes(buf[4..].try_into().expect("8 bytes")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = create_get_request("geds-test", "a/key.bin", 1024, 4096);
        let (bucket, key, position, length) = parse_get_request(&request).unwrap();
        assert_eq!(bucket, "geds-test");
        assert_eq!(key, "a/key.bin");
        assert_eq!(position, 1024);
        assert_eq!(length, 4096);
    }

    #[test]
    fn parses_the_documented_request() {
        let parsed = parse_get_request("GET nase/baer\nRANGE 0 1073766400").unwrap();
        assert_eq!(parsed, ("nase".to_string(), "baer".to_string(), 0, 1073766400));
    }

    #[test]
    fn keys_may_contain_slashes() {
        let (bucket, key, _, _) =
            parse_get_request("GET bucket/deep/nested/key\nRANGE 5 10").unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "deep/nested/key");
    }

    #[test]
    fn rejects_malformed_requests() {
        for request in [
            "",
            "GET \nRANGE 0 1",
            "GET bucketonly\nRANGE 0 1",
            "PUT bucket/key\nRANGE 0 1",
            "GET bucket/key\nRANGE x 1",
            "GET bucket/key",
        ] {
            assert!(parse_get_request(request).is_err(), "{request:?}");
        }
    }

    #[test]
    fn response_header_round_trip() {
        let header = Response::ok(123456789);
        assert_eq!(Response::decode(&header.encode()), header);

        let err = Error::NotFound("missing".to_string());
        let header = Response::error(&err);
        let decoded = Response::decode(&header.encode());
        assert_eq!(decoded.status_code, tonic::Code::NotFound as i32);
        assert_eq!(decoded.length, 7);
    }
}
