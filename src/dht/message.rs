use super::error::{DhtError, ErrorCode};
use super::node::NodeId;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

pub type TransactionId = Bytes;

/// The four KRPC methods of BEP-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryKind {
    pub fn name(self) -> &'static str {
        match self {
            QueryKind::Ping => "ping",
            QueryKind::FindNode => "find_node",
            QueryKind::GetPeers => "get_peers",
            QueryKind::AnnouncePeer => "announce_peer",
        }
    }

    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(QueryKind::Ping),
            b"find_node" => Some(QueryKind::FindNode),
            b"get_peers" => Some(QueryKind::GetPeers),
            b"announce_peer" => Some(QueryKind::AnnouncePeer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        token: Bytes,
        /// Use the source port of the datagram instead of `port`.
        implied_port: bool,
    },
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        match self {
            Query::Ping => QueryKind::Ping,
            Query::FindNode { .. } => QueryKind::FindNode,
            Query::GetPeers { .. } => QueryKind::GetPeers,
            Query::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
        }
    }
}

/// Response payloads. Node and peer lists stay in their compact wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping,
    FindNode {
        nodes: Bytes,
    },
    GetPeers {
        token: Option<Bytes>,
        /// Compact 6-byte peers.
        values: Option<Vec<Bytes>>,
        nodes: Option<Bytes>,
    },
    AnnouncePeer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query { id: NodeId, query: Query },
    Response { id: NodeId, response: Response },
    Error { code: i64, message: String },
}

/// One KRPC datagram.
///
/// Queries are built without a transaction id; the message loop assigns one
/// when the query is first sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtMessage {
    pub transaction_id: Option<TransactionId>,
    pub version: Option<Bytes>,
    pub body: Body,
}

impl DhtMessage {
    pub fn query(our_id: NodeId, query: Query) -> Self {
        Self {
            transaction_id: None,
            version: None,
            body: Body::Query { id: our_id, query },
        }
    }

    pub fn ping(our_id: NodeId) -> Self {
        Self::query(our_id, Query::Ping)
    }

    pub fn find_node(our_id: NodeId, target: NodeId) -> Self {
        Self::query(our_id, Query::FindNode { target })
    }

    pub fn get_peers(our_id: NodeId, info_hash: NodeId) -> Self {
        Self::query(our_id, Query::GetPeers { info_hash })
    }

    pub fn announce_peer(our_id: NodeId, info_hash: NodeId, port: u16, token: Bytes) -> Self {
        Self::query(
            our_id,
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            },
        )
    }

    pub fn response(transaction_id: TransactionId, our_id: NodeId, response: Response) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            version: None,
            body: Body::Response {
                id: our_id,
                response,
            },
        }
    }

    pub fn error(transaction_id: TransactionId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            version: None,
            body: Body::Error {
                code: code.code(),
                message: message.into(),
            },
        }
    }

    /// Id of the sending node; error messages carry none.
    pub fn sender_id(&self) -> Option<NodeId> {
        match &self.body {
            Body::Query { id, .. } | Body::Response { id, .. } => Some(*id),
            Body::Error { .. } => None,
        }
    }

    pub fn query_kind(&self) -> Option<QueryKind> {
        match &self.body {
            Body::Query { query, .. } => Some(query.kind()),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, DhtError> {
        let transaction_id = self
            .transaction_id
            .clone()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let mut msg = Value::dict().with("t", transaction_id);
        if let Some(version) = &self.version {
            msg = msg.with("v", version.clone());
        }

        let msg = match &self.body {
            Body::Query { id, query } => msg
                .with("y", "q")
                .with("q", query.kind().name())
                .with("a", query_args(id, query)),
            Body::Response { id, response } => {
                msg.with("y", "r").with("r", response_values(id, response))
            }
            Body::Error { code, message } => msg.with("y", "e").with(
                "e",
                Value::List(vec![Value::Integer(*code), Value::string(message)]),
            ),
        };

        Ok(encode(&msg))
    }

    /// Decodes a datagram.
    ///
    /// Responses do not name their method, so `pending` maps a transaction
    /// id to the kind of query that is waiting for it.
    pub fn decode(
        data: &[u8],
        pending: impl FnOnce(&TransactionId) -> Option<QueryKind>,
    ) -> Result<Self, DhtError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| DhtError::InvalidMessage("expected dict".into()))?;

        let transaction_id = dict
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;
        let version = dict.get(b"v".as_slice()).and_then(Value::as_bytes).cloned();

        let msg_type = dict
            .get(b"y".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        let body = match &msg_type[..] {
            b"q" => parse_query(&transaction_id, dict)?,
            b"r" => {
                let kind = pending(&transaction_id).ok_or_else(|| {
                    DhtError::InvalidMessage("response had unknown transaction id".into())
                })?;
                parse_response(kind, dict)?
            }
            b"e" => parse_error(dict)?,
            other => {
                return Err(DhtError::InvalidMessage(format!(
                    "unknown message type: {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        Ok(Self {
            transaction_id: Some(transaction_id),
            version,
            body,
        })
    }
}

fn query_args(id: &NodeId, query: &Query) -> Value {
    let args = Value::dict().with("id", id_value(id));
    match query {
        Query::Ping => args,
        Query::FindNode { target } => args.with("target", id_value(target)),
        Query::GetPeers { info_hash } => args.with("info_hash", id_value(info_hash)),
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            let args = args
                .with("info_hash", id_value(info_hash))
                .with("port", i64::from(*port))
                .with("token", token.clone());
            if *implied_port {
                args.with("implied_port", 1i64)
            } else {
                args
            }
        }
    }
}

fn response_values(id: &NodeId, response: &Response) -> Value {
    let values = Value::dict().with("id", id_value(id));
    match response {
        Response::Ping | Response::AnnouncePeer => values,
        Response::FindNode { nodes } => values.with("nodes", nodes.clone()),
        Response::GetPeers {
            token,
            values: peers,
            nodes,
        } => {
            let mut values = values;
            if let Some(token) = token {
                values = values.with("token", token.clone());
            }
            if let Some(peers) = peers {
                let list = peers.iter().cloned().map(Value::Bytes).collect::<Vec<_>>();
                values = values.with("values", list);
            }
            if let Some(nodes) = nodes {
                values = values.with("nodes", nodes.clone());
            }
            values
        }
    }
}

fn id_value(id: &NodeId) -> Value {
    Value::Bytes(Bytes::copy_from_slice(id.as_bytes()))
}

fn sender_id(section: &BTreeMap<Bytes, Value>) -> Result<NodeId, DhtError> {
    section
        .get(b"id".as_slice())
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())
        .ok_or_else(|| DhtError::InvalidMessage("missing or malformed sender id".into()))
}

fn parse_query(transaction_id: &TransactionId, dict: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let name = dict
        .get(b"q".as_slice())
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;
    let args = dict
        .get(b"a".as_slice())
        .and_then(Value::as_dict)
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;
    let id = sender_id(args)?;

    let kind = QueryKind::from_name(name).ok_or_else(|| DhtError::Protocol {
        transaction_id: transaction_id.clone(),
        code: ErrorCode::MethodUnknown,
        message: "Method Unknown".into(),
    })?;

    let invalid = |what: &str| DhtError::Protocol {
        transaction_id: transaction_id.clone(),
        code: ErrorCode::Protocol,
        message: format!("invalid or missing argument: {}", what),
    };
    let hash_arg = |key: &'static str| {
        args.get(key.as_bytes())
            .and_then(Value::as_bytes)
            .and_then(|b| NodeId::from_bytes(b).ok())
            .ok_or_else(|| invalid(key))
    };

    let query = match kind {
        QueryKind::Ping => Query::Ping,
        QueryKind::FindNode => Query::FindNode {
            target: hash_arg("target")?,
        },
        QueryKind::GetPeers => Query::GetPeers {
            info_hash: hash_arg("info_hash")?,
        },
        QueryKind::AnnouncePeer => {
            let info_hash = hash_arg("info_hash")?;
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(Value::as_integer)
                .is_some_and(|v| v != 0);
            let port = match args.get(b"port".as_slice()).and_then(Value::as_integer) {
                Some(port) => u16::try_from(port).map_err(|_| invalid("port"))?,
                None if implied_port => 0,
                None => return Err(invalid("port")),
            };
            let token = args
                .get(b"token".as_slice())
                .and_then(Value::as_bytes)
                .cloned()
                .ok_or_else(|| invalid("token"))?;
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            }
        }
    };

    Ok(Body::Query { id, query })
}

fn parse_response(kind: QueryKind, dict: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let values = dict
        .get(b"r".as_slice())
        .and_then(Value::as_dict)
        .ok_or_else(|| DhtError::InvalidMessage("missing response values".into()))?;
    let id = sender_id(values)?;
    let bytes = |key: &[u8]| values.get(key).and_then(Value::as_bytes).cloned();

    let response = match kind {
        QueryKind::Ping => Response::Ping,
        QueryKind::AnnouncePeer => Response::AnnouncePeer,
        QueryKind::FindNode => Response::FindNode {
            nodes: bytes(b"nodes".as_slice()).unwrap_or_default(),
        },
        QueryKind::GetPeers => Response::GetPeers {
            token: bytes(b"token".as_slice()),
            values: values
                .get(b"values".as_slice())
                .and_then(Value::as_list)
                .map(|list| list.iter().filter_map(Value::as_bytes).cloned().collect()),
            nodes: bytes(b"nodes".as_slice()),
        },
    };

    Ok(Body::Response { id, response })
}

fn parse_error(dict: &BTreeMap<Bytes, Value>) -> Result<Body, DhtError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;
    let code = list
        .first()
        .and_then(Value::as_integer)
        .unwrap_or(ErrorCode::Generic.code());
    let message = list
        .get(1)
        .and_then(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    Ok(Body::Error { code, message })
}
