use crate::runtime::ChannelKind;

/// A call from process code into the runtime.
///
/// Values that travel with a request (message payloads, spawn code and
/// arguments) are staged in the isolate's outbox so they stay rooted while the
/// process is parked.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Spawn,
    Send { channel: String },
    Receive { channel: String, nonblocking: bool },
    Barrier { channel: String, expected: i64 },
    CreateChannel { name: String, kind: ChannelKind },
    DestroyChannel { name: String },
    SetWorkers(i64),
    GetWorkers,
    SetRecycleLimit(i64),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Spawn => "spawn",
            Request::Send { .. } => "send",
            Request::Receive { .. } => "receive",
            Request::Barrier { .. } => "barrier",
            Request::CreateChannel { .. } => "newchannel",
            Request::DestroyChannel { .. } => "delchannel",
            Request::SetWorkers(_) => "setnumworkers",
            Request::GetWorkers => "getnumworkers",
            Request::SetRecycleLimit(_) => "recycle",
        }
    }
}
