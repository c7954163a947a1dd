//! Function evaluator client: unary gRPC over HTTP/2.
//!
//! Each call carries one length-prefixed protobuf message:
//! - 1 byte: compression flag (always 0)
//! - 4 bytes: message length (big-endian)
//! - N bytes: protobuf payload

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper_util::rt::{TokioExecutor, TokioIo};
use kpt_core::{CancellationToken, Error, ErrorKind, Result};
use prost::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::{FunctionRunner, FunctionSpec};

pub const EVALUATE_PATH: &str = "/evaluator.FunctionEvaluator/EvaluateFunction";
const HEADER_SIZE: usize = 5;
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct EvaluateFunctionRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub resource_list: Vec<u8>,
    #[prost(string, tag = "2")]
    pub image: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EvaluateFunctionResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub resource_list: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub log: Vec<u8>,
}

pub fn encode_frame<M: Message>(msg: &M) -> Bytes {
    let len = msg.encoded_len();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // BytesMut grows as needed, so encoding cannot run out of space.
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

pub fn decode_frame<M: Message + Default>(body: &[u8]) -> Result<M> {
    if body.len() < HEADER_SIZE {
        return Err(Error::transport(format!("evaluator response too short: {} bytes", body.len())));
    }
    if body[0] != 0 {
        return Err(Error::transport("compressed evaluator responses are not supported"));
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if len > MAX_MESSAGE_SIZE || body.len() < HEADER_SIZE + len {
        return Err(Error::transport(format!("evaluator frame of {} bytes is truncated or too large", len)));
    }
    M::decode(&body[HEADER_SIZE..HEADER_SIZE + len]).map_err(|e| Error::parse(format!("decoding evaluator response: {}", e)))
}

fn status_kind(code: u32) -> ErrorKind {
    match code {
        3 | 9 | 11 => ErrorKind::InvalidParam,
        5 => ErrorKind::NotFound,
        6 => ErrorKind::AlreadyExists,
        7 | 16 => ErrorKind::AuthError,
        12 => ErrorKind::UnsupportedFunction,
        4 | 14 => ErrorKind::TransportError,
        _ => ErrorKind::Internal,
    }
}

fn check_status(headers: &HeaderMap) -> Result<()> {
    let Some(code) = headers.get("grpc-status").and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<u32>().ok()) else {
        return Ok(());
    };
    if code == 0 {
        return Ok(());
    }
    let message = headers.get("grpc-message").and_then(|v| v.to_str().ok()).unwrap_or_default();
    Err(Error::new(status_kind(code), format!("evaluator returned status {}: {}", code, message)))
}

fn transport<E: std::error::Error + Send + Sync + 'static>(what: &str) -> impl FnOnce(E) -> Error + '_ {
    move |e| Error::transport(format!("{}: {}", what, e)).with_source(e)
}

/// Sends one evaluation over an established connection.
pub async fn evaluate<T>(io: T, authority: &str, image: &str, input: &[u8]) -> Result<Vec<u8>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
        .await
        .map_err(transport("http/2 handshake"))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "evaluator connection closed");
        }
    });

    let msg = EvaluateFunctionRequest { resource_list: input.to_vec(), image: image.to_string() };
    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(format!("http://{}{}", authority, EVALUATE_PATH))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Full::new(encode_frame(&msg)))
        .map_err(|e| Error::internal(format!("building evaluator request: {}", e)))?;
    let resp = sender.send_request(req).await.map_err(transport("sending evaluator request"))?;
    if !resp.status().is_success() {
        return Err(Error::transport(format!("evaluator answered HTTP {}", resp.status())));
    }
    // Trailers-only responses carry the status in the headers.
    check_status(resp.headers())?;
    let collected = resp.into_body().collect().await.map_err(transport("reading evaluator response"))?;
    if let Some(trailers) = collected.trailers() {
        check_status(trailers)?;
    }
    let out: EvaluateFunctionResponse = decode_frame(&collected.to_bytes())?;
    if !out.log.is_empty() {
        debug!(image, log = %String::from_utf8_lossy(&out.log).trim(), "function log");
    }
    Ok(out.resource_list)
}

/// Talks to an evaluator sidecar at `host:port`.
#[derive(Debug, Clone)]
pub struct GrpcRunner {
    addr: String,
}

impl GrpcRunner {
    pub fn new(addr: &str) -> Self {
        let addr = addr.trim_start_matches("http://").trim_end_matches('/');
        Self { addr: addr.to_string() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl FunctionRunner for GrpcRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
        let image = func
            .image
            .as_deref()
            .ok_or_else(|| Error::unsupported_function("evaluator runs image functions only").with_op("fn.grpc"))?;
        let call = async {
            let stream = TcpStream::connect(&self.addr).await.map_err(transport("connecting to evaluator"))?;
            evaluate(stream, &self.addr, image, input).await
        };
        tokio::select! {
            out = call => out.map_err(|e| e.with_op("fn.grpc")),
            _ = cancel.cancelled() => Err(Error::internal("cancelled").with_op("fn.grpc")),
        }
    }
}
