use crucible::prelude::{
    Broadcast, Bytes, CodecDriver, ConnectionHandler, ConnectionId, Delegator, DelegatorFactory,
    Headers, HttpRequest, HttpResponse, HttpServerCodec, MessageCtx, ServerRef, StatusCode,
    StreamHandler, WorkerRef,
};
use flint::time::unix_secs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// State shared by every handler across all workers.
pub struct BeaconState {
    started_at: u64,
    requests: AtomicU64,
}

impl BeaconState {
    pub fn new() -> Arc<BeaconState> {
        Arc::new(BeaconState {
            started_at: unix_secs(),
            requests: AtomicU64::new(0),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        unix_secs().saturating_sub(self.started_at)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

pub fn delegator_factory(state: Arc<BeaconState>) -> Arc<dyn DelegatorFactory> {
    Arc::new(move |_server: ServerRef, _worker: WorkerRef| {
        Box::new(BeaconDelegator {
            state: state.clone(),
        }) as Box<dyn Delegator>
    })
}

struct BeaconDelegator {
    state: Arc<BeaconState>,
}

impl Delegator for BeaconDelegator {
    fn accept_connection(&mut self, _id: ConnectionId) -> Option<Box<dyn StreamHandler>> {
        Some(CodecDriver::boxed(
            HttpServerCodec::new(),
            BeaconHandler {
                state: self.state.clone(),
            },
        ))
    }

    fn handle_broadcast(&mut self, _message: &Broadcast) {}
}

struct BeaconHandler {
    state: Arc<BeaconState>,
}

impl ConnectionHandler for BeaconHandler {
    type Codec = HttpServerCodec;

    fn message(&mut self, request: HttpRequest, ctx: &mut MessageCtx<HttpServerCodec>) {
        self.state.requests.fetch_add(1, Ordering::Relaxed);

        let response = match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/status") => status_response(&self.state),
            ("POST", "/echo") => HttpResponse::ok(request.body),
            _ => HttpResponse::new(
                StatusCode::new(404, "Not Found"),
                text_headers(),
                Bytes::from_static(b"no such resource\n"),
            ),
        };

        ctx.send(&response);
    }
}

fn status_response(state: &BeaconState) -> HttpResponse {
    let body = format!(
        "beacon up {}s, {} requests served\n",
        state.uptime_secs(),
        state.requests()
    );

    HttpResponse::new(StatusCode::ok(), text_headers(), Bytes::from(body))
}

fn text_headers() -> Headers {
    Headers::from_pairs(&[("Content-Type", "text/plain")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible::prelude::{
        BytesMut, Codec, HttpClientCodec, IOSystem, IOSystemConfig, ServerSettings,
    };
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    fn boot() -> (IOSystem, u16, Arc<BeaconState>) {
        let system = IOSystem::new(
            IOSystemConfig {
                name: "beacon-test".to_string(),
                num_workers: Some(1),
            },
            None,
        )
        .unwrap();

        let state = BeaconState::new();
        let server = system
            .attach_server(
                ServerSettings {
                    name: "beacon-http".to_string(),
                    port: 0,
                    ..ServerSettings::default()
                },
                delegator_factory(state.clone()),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let port = loop {
            if let Some(port) = server.local_port() {
                break port;
            }
            assert!(Instant::now() < deadline, "server never bound");
            sleep(Duration::from_millis(10));
        };

        (system, port, state)
    }

    fn request(port: u16, request: &HttpRequest) -> HttpResponse {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut wire = BytesMut::new();
        HttpClientCodec::encode(request, &mut wire);
        stream.write_all(&wire).unwrap();

        let mut codec = HttpClientCodec::new();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];

        while out.is_empty() {
            let count = stream.read(&mut buf).unwrap();
            assert!(count > 0, "connection closed before a full response");
            codec.decode(&buf[..count], &mut out).unwrap();
        }

        out.remove(0)
    }

    #[test]
    fn test_status_route() {
        let (system, port, state) = boot();

        let response = request(port, &HttpRequest::get("/status"));
        assert_eq!(response.code.code, 200);
        assert_eq!(response.headers.get("content-type"), Some("text/plain"));

        let body = String::from_utf8(response.body.to_vec()).unwrap();
        assert!(body.starts_with("beacon up "));
        assert_eq!(state.requests(), 1);

        system.shutdown(true);
    }

    #[test]
    fn test_echo_route() {
        let (system, port, _state) = boot();

        let echo = HttpRequest::new(
            "POST",
            "/echo",
            Headers::new(),
            Bytes::from_static(b"signal"),
        );

        let response = request(port, &echo);
        assert_eq!(response.code.code, 200);
        assert_eq!(&response.body[..], b"signal");

        system.shutdown(true);
    }

    #[test]
    fn test_unknown_route_is_404() {
        let (system, port, _state) = boot();

        let response = request(port, &HttpRequest::get("/nope"));
        assert_eq!(response.code.code, 404);

        system.shutdown(true);
    }
}
