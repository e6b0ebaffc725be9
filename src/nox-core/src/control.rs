//! Typed codec for control records.
//!
//! A control record is the payload of a [`FrameKind::Control`] frame: one
//! opcode byte followed by an opcode-specific fixed or count-prefixed body.
//! All integers are big-endian.
//!
//! [`FrameKind::Control`]: crate::frame::FrameKind::Control

use std::net::Ipv4Addr;

use thiserror::Error;

/// Capability flags advertised in HELLO.
pub const CAP_IPV6: u16 = 0x0001;
pub const CAP_REKEY: u16 = 0x0002;
pub const CAP_MTU_NEG: u16 = 0x0004;
pub const CAP_QUIC: u16 = 0x0008;
pub const CAP_REPLAY_GUARD: u16 = 0x0010;

/// Control opcodes.
pub const OP_HELLO: u8 = 0x01;
pub const OP_ASSIGN_IP: u8 = 0x02;
pub const OP_ROUTES: u8 = 0x03;
pub const OP_HEARTBEAT: u8 = 0x04;
pub const OP_REKEY: u8 = 0x05;
pub const OP_CLOSE: u8 = 0x06;
pub const OP_ERROR: u8 = 0x07;

/// Wire error codes carried by Error records.
pub const ERR_BAD_HELLO: u16 = 0x0001;
pub const ERR_VERSION_MISMATCH: u16 = 0x0002;
pub const ERR_EXHAUSTED: u16 = 0x0003;

const HELLO_LEN: usize = 2 + 8 + 16 + 2;
const ASSIGN_LEN: usize = 8 + 4 + 1 + 2 + 16;
const HEARTBEAT_LEN: usize = 4;
const REKEY_LEN: usize = 4 + 16;
const MAX_REASON_LEN: usize = 255;

/// Control codec errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("empty control payload")]
    Empty,

    #[error("unknown control opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("{record} record has wrong length {got}")]
    Length { record: &'static str, got: usize },
}

/// Client capabilities and handshake nonce. Fixed 28-byte body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub capabilities: u16,
    pub session_id: [u8; 8],
    pub client_nonce: [u8; 16],
    pub desired_mtu: u16,
}

/// Server lease grant and handshake nonce. Fixed 31-byte body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignIp {
    pub session_id: [u8; 8],
    pub ipv4: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
    pub server_nonce: [u8; 16],
}

/// One IPv4 prefix pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

/// Liveness probe with an echo counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub echo: u32,
}

/// Epoch advance announcement. Reserved: decoded for wire compatibility,
/// no rekey driver exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rekey {
    pub epoch: u32,
    pub nonce: [u8; 16],
}

/// Close and Error share one body: a code plus a short reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub code: u16,
    pub reason: String,
}

/// A decoded control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    Hello(Hello),
    AssignIp(AssignIp),
    Routes(Vec<Route>),
    Heartbeat(Heartbeat),
    Rekey(Rekey),
    Close(Close),
    Error(Close),
}

impl ControlRecord {
    /// Opcode byte for this record.
    pub fn opcode(&self) -> u8 {
        match self {
            ControlRecord::Hello(_) => OP_HELLO,
            ControlRecord::AssignIp(_) => OP_ASSIGN_IP,
            ControlRecord::Routes(_) => OP_ROUTES,
            ControlRecord::Heartbeat(_) => OP_HEARTBEAT,
            ControlRecord::Rekey(_) => OP_REKEY,
            ControlRecord::Close(_) => OP_CLOSE,
            ControlRecord::Error(_) => OP_ERROR,
        }
    }

    /// Serialize opcode plus body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            ControlRecord::Hello(h) => {
                buf.extend_from_slice(&h.capabilities.to_be_bytes());
                buf.extend_from_slice(&h.session_id);
                buf.extend_from_slice(&h.client_nonce);
                buf.extend_from_slice(&h.desired_mtu.to_be_bytes());
            }
            ControlRecord::AssignIp(a) => {
                buf.extend_from_slice(&a.session_id);
                buf.extend_from_slice(&a.ipv4.octets());
                buf.push(a.prefix_len);
                buf.extend_from_slice(&a.mtu.to_be_bytes());
                buf.extend_from_slice(&a.server_nonce);
            }
            ControlRecord::Routes(routes) => {
                let count = routes.len().min(u8::MAX as usize);
                buf.push(count as u8);
                for route in &routes[..count] {
                    buf.extend_from_slice(&route.network.octets());
                    buf.push(route.prefix);
                }
            }
            ControlRecord::Heartbeat(h) => {
                buf.extend_from_slice(&h.echo.to_be_bytes());
            }
            ControlRecord::Rekey(r) => {
                buf.extend_from_slice(&r.epoch.to_be_bytes());
                buf.extend_from_slice(&r.nonce);
            }
            ControlRecord::Close(c) | ControlRecord::Error(c) => {
                let reason = c.reason.as_bytes();
                let len = reason.len().min(MAX_REASON_LEN);
                buf.extend_from_slice(&c.code.to_be_bytes());
                buf.push(len as u8);
                buf.extend_from_slice(&reason[..len]);
            }
        }
        buf
    }

    /// Parse a control record from a Control frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ControlError> {
        let (&opcode, body) = payload.split_first().ok_or(ControlError::Empty)?;
        match opcode {
            OP_HELLO => {
                if body.len() != HELLO_LEN {
                    return Err(ControlError::Length {
                        record: "hello",
                        got: body.len(),
                    });
                }
                let mut session_id = [0u8; 8];
                session_id.copy_from_slice(&body[2..10]);
                let mut client_nonce = [0u8; 16];
                client_nonce.copy_from_slice(&body[10..26]);
                Ok(ControlRecord::Hello(Hello {
                    capabilities: u16::from_be_bytes([body[0], body[1]]),
                    session_id,
                    client_nonce,
                    desired_mtu: u16::from_be_bytes([body[26], body[27]]),
                }))
            }
            OP_ASSIGN_IP => {
                if body.len() != ASSIGN_LEN {
                    return Err(ControlError::Length {
                        record: "assign",
                        got: body.len(),
                    });
                }
                let mut session_id = [0u8; 8];
                session_id.copy_from_slice(&body[..8]);
                let mut server_nonce = [0u8; 16];
                server_nonce.copy_from_slice(&body[15..31]);
                Ok(ControlRecord::AssignIp(AssignIp {
                    session_id,
                    ipv4: Ipv4Addr::new(body[8], body[9], body[10], body[11]),
                    prefix_len: body[12],
                    mtu: u16::from_be_bytes([body[13], body[14]]),
                    server_nonce,
                }))
            }
            OP_ROUTES => {
                let (&count, entries) = body.split_first().ok_or(ControlError::Length {
                    record: "routes",
                    got: body.len(),
                })?;
                if entries.len() != count as usize * 5 {
                    return Err(ControlError::Length {
                        record: "routes",
                        got: body.len(),
                    });
                }
                let routes = entries
                    .chunks_exact(5)
                    .map(|e| Route {
                        network: Ipv4Addr::new(e[0], e[1], e[2], e[3]),
                        prefix: e[4],
                    })
                    .collect();
                Ok(ControlRecord::Routes(routes))
            }
            OP_HEARTBEAT => {
                if body.len() != HEARTBEAT_LEN {
                    return Err(ControlError::Length {
                        record: "heartbeat",
                        got: body.len(),
                    });
                }
                Ok(ControlRecord::Heartbeat(Heartbeat {
                    echo: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                }))
            }
            OP_REKEY => {
                if body.len() != REKEY_LEN {
                    return Err(ControlError::Length {
                        record: "rekey",
                        got: body.len(),
                    });
                }
                let mut nonce = [0u8; 16];
                nonce.copy_from_slice(&body[4..]);
                Ok(ControlRecord::Rekey(Rekey {
                    epoch: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                    nonce,
                }))
            }
            OP_CLOSE | OP_ERROR => {
                if body.len() < 3 {
                    return Err(ControlError::Length {
                        record: "close",
                        got: body.len(),
                    });
                }
                let reason_len = body[2] as usize;
                if body.len() != 3 + reason_len {
                    return Err(ControlError::Length {
                        record: "close",
                        got: body.len(),
                    });
                }
                let close = Close {
                    code: u16::from_be_bytes([body[0], body[1]]),
                    reason: String::from_utf8_lossy(&body[3..]).into_owned(),
                };
                if opcode == OP_CLOSE {
                    Ok(ControlRecord::Close(close))
                } else {
                    Ok(ControlRecord::Error(close))
                }
            }
            other => Err(ControlError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: ControlRecord) {
        let raw = record.encode();
        assert_eq!(ControlRecord::decode(&raw).unwrap(), record);
    }

    #[test]
    fn hello_roundtrip_and_size() {
        let hello = ControlRecord::Hello(Hello {
            capabilities: CAP_MTU_NEG | CAP_REPLAY_GUARD,
            session_id: [1, 2, 3, 4, 5, 6, 7, 8],
            client_nonce: [0xAA; 16],
            desired_mtu: 1400,
        });
        assert_eq!(hello.encode().len(), 1 + 28);
        roundtrip(hello);
    }

    #[test]
    fn assign_roundtrip_and_size() {
        let assign = ControlRecord::AssignIp(AssignIp {
            session_id: [8, 7, 6, 5, 4, 3, 2, 1],
            ipv4: Ipv4Addr::new(10, 8, 0, 2),
            prefix_len: 24,
            mtu: 1400,
            server_nonce: [0xBB; 16],
        });
        assert_eq!(assign.encode().len(), 1 + 31);
        roundtrip(assign);
    }

    #[test]
    fn routes_roundtrip() {
        roundtrip(ControlRecord::Routes(vec![
            Route {
                network: Ipv4Addr::new(10, 8, 0, 0),
                prefix: 24,
            },
            Route {
                network: Ipv4Addr::new(192, 168, 0, 0),
                prefix: 16,
            },
        ]));
        roundtrip(ControlRecord::Routes(Vec::new()));
    }

    #[test]
    fn heartbeat_roundtrip() {
        roundtrip(ControlRecord::Heartbeat(Heartbeat { echo: 0xDEADBEEF }));
    }

    #[test]
    fn rekey_roundtrip() {
        roundtrip(ControlRecord::Rekey(Rekey {
            epoch: 2,
            nonce: [3; 16],
        }));
    }

    #[test]
    fn close_and_error_roundtrip() {
        roundtrip(ControlRecord::Close(Close {
            code: 0,
            reason: "bye".into(),
        }));
        roundtrip(ControlRecord::Error(Close {
            code: ERR_EXHAUSTED,
            reason: "no available addresses".into(),
        }));
    }

    #[test]
    fn long_reason_is_truncated() {
        let record = ControlRecord::Error(Close {
            code: ERR_BAD_HELLO,
            reason: "x".repeat(400),
        });
        let raw = record.encode();
        assert_eq!(raw.len(), 1 + 2 + 1 + 255);
        match ControlRecord::decode(&raw).unwrap() {
            ControlRecord::Error(close) => assert_eq!(close.reason.len(), 255),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn wrong_lengths_rejected() {
        assert!(matches!(
            ControlRecord::decode(&[OP_HELLO, 0, 0]),
            Err(ControlError::Length { record: "hello", .. })
        ));
        assert!(matches!(
            ControlRecord::decode(&[OP_ASSIGN_IP; 5]),
            Err(ControlError::Length { record: "assign", .. })
        ));
        assert!(matches!(
            ControlRecord::decode(&[OP_HEARTBEAT, 1, 2, 3]),
            Err(ControlError::Length { .. })
        ));
        assert!(matches!(
            ControlRecord::decode(&[OP_ROUTES, 2, 0, 0, 0, 0, 24]),
            Err(ControlError::Length { record: "routes", .. })
        ));
    }

    #[test]
    fn empty_and_unknown_rejected() {
        assert!(matches!(ControlRecord::decode(&[]), Err(ControlError::Empty)));
        assert!(matches!(
            ControlRecord::decode(&[0x7E, 0, 0]),
            Err(ControlError::UnknownOpcode(0x7E))
        ));
    }
}
