//! Convenience re-exports for applications built on the framework.

pub use bytes::{Bytes, BytesMut};

pub use crate::codec::http::{
    Headers, HttpClientCodec, HttpRequest, HttpResponse, HttpServerCodec, StatusCode, Version,
};
pub use crate::codec::{Codec, ProtocolViolation};
pub use crate::connection::{CloseCause, ConnectionId};
pub use crate::handler::{
    Broadcast, CodecDriver, ConnectionCtx, ConnectionHandler, Delegator, DelegatorFactory,
    MessageCtx, StreamHandler, Task, TaskId, TaskMessage,
};
pub use crate::manager::TaskProxy;
pub use crate::metrics::{Counter, Metrics, Rate};
pub use crate::server::{
    next_volume_state, ConfigError, ServerRef, ServerSettings, VolumeState,
};
pub use crate::system::{IOSystem, IOSystemConfig};
pub use crate::worker::{WorkerId, WorkerRef};
