//! In-process transport for tests and single-binary setups.
//!
//! `ram://name` endpoints with the same name share one pipe for as long as
//! any handle to it is alive.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dcomm_core::{DcommResult, Envelope};
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::{Direction, Transport, TransportInfo, TransportOptions};

const SCHEME: &str = "ram://";

pub(crate) const INFO: TransportInfo = TransportInfo {
    name: "ram",
    example: "ram://name",
    matches: is_ram,
    build,
    is_path: false,
};

fn is_ram(uri: &str) -> bool {
    uri.strip_prefix(SCHEME).is_some_and(|name| !name.is_empty())
}

fn build(uri: &str, direction: Direction, _options: &TransportOptions) -> DcommResult<Arc<dyn Transport>> {
    Ok(Arc::new(RamTransport::new(uri, direction)))
}

type Queue = Mutex<VecDeque<(String, Vec<u8>)>>;

#[derive(Default)]
struct Pipe {
    /// Toward the endpoint's owner.
    inbound: Queue,
    /// Back toward whoever sent.
    outbound: Queue,
}

lazy_static! {
    static ref PIPES: Mutex<HashMap<String, Weak<Pipe>>> = Mutex::new(HashMap::new());
}

fn attach(name: &str) -> Arc<Pipe> {
    let mut pipes = PIPES.lock();
    if let Some(pipe) = pipes.get(name).and_then(Weak::upgrade) {
        return pipe;
    }
    pipes.retain(|_, weak| weak.strong_count() > 0);
    let pipe = Arc::new(Pipe::default());
    pipes.insert(name.to_string(), Arc::downgrade(&pipe));
    pipe
}

pub struct RamTransport {
    uri: String,
    direction: Direction,
    pipe: Arc<Pipe>,
}

impl RamTransport {
    pub fn new(uri: &str, direction: Direction) -> Self {
        let name = uri.strip_prefix(SCHEME).unwrap_or(uri);
        Self {
            uri: uri.to_string(),
            direction,
            pipe: attach(name),
        }
    }

    fn write_queue(&self) -> &Queue {
        match self.direction {
            Direction::Destward => &self.pipe.inbound,
            Direction::Srcward => &self.pipe.outbound,
        }
    }

    fn read_queue(&self) -> &Queue {
        match self.direction {
            Direction::Destward => &self.pipe.outbound,
            Direction::Srcward => &self.pipe.inbound,
        }
    }
}

fn matches(id: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |prefix| id.starts_with(prefix))
}

#[async_trait]
impl Transport for RamTransport {
    fn endpoint(&self) -> &str {
        &self.uri
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, payload: &[u8], _dest_hint: Option<&str>) -> DcommResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.write_queue().lock().push_back((id.clone(), payload.to_vec()));
        Ok(id)
    }

    async fn receive(&self, filter: Option<&str>) -> DcommResult<Option<Envelope>> {
        let mut queue = self.read_queue().lock();
        let Some(pos) = queue.iter().position(|(id, _)| matches(id, filter)) else {
            return Ok(None);
        };
        Ok(queue.remove(pos).map(|(_, bytes)| Envelope::new(bytes)))
    }

    async fn peek(&self, filter: Option<&str>) -> DcommResult<bool> {
        Ok(self.read_queue().lock().iter().any(|(id, _)| matches(id, filter)))
    }
}
