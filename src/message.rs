use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{ProtocolSnafu, Result};
use crate::id::Id;
use crate::sexp::Value;

/// Everything that travels between peers, one tagged variant per frame
/// type. A frame is the printed form of `encode()`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello {
        name: String,
        response: Option<Vec<u8>>,
    },
    Challenge {
        salt: Vec<u8>,
    },
    Login {
        site: u16,
        session: String,
    },
    Sync {
        buffer: String,
        mode: Option<String>,
        content: String,
        runs: Vec<(usize, Id, bool)>,
    },
    Desync {
        buffer: String,
    },
    Insert {
        buffer: String,
        id: Id,
        hint: usize,
        content: String,
    },
    Delete {
        buffer: String,
        hint: usize,
        spans: Vec<(usize, Id)>,
    },
    Cursor {
        buffer: String,
        site: u16,
        point_hint: usize,
        point: Option<Id>,
        mark_hint: usize,
        mark: Option<Id>,
    },
    Contact {
        site: u16,
        name: Option<String>,
    },
    Focus {
        site: u16,
        buffer: String,
    },
    OverlayAdd {
        buffer: String,
        site: u16,
        clock: u32,
        species: String,
        front_advance: bool,
        rear_advance: bool,
        start_hint: usize,
        start: Id,
        end_hint: usize,
        end: Id,
    },
    OverlayMove {
        buffer: String,
        site: u16,
        clock: u32,
        start_hint: usize,
        start: Id,
        end_hint: usize,
        end: Id,
    },
    OverlayPut {
        buffer: String,
        site: u16,
        clock: u32,
        prop: String,
        value: Value,
    },
    OverlayRemove {
        buffer: String,
        site: u16,
        clock: u32,
    },
    Get {
        buffer: String,
    },
}

fn id_value(id: &Id) -> Value {
    Value::Str(BASE64.encode(id.as_bytes()))
}

fn opt_id_value(id: &Option<Id>) -> Value {
    match id {
        Some(id) => id_value(id),
        None => Value::Nil,
    }
}

impl Message {
    pub fn encode(&self) -> Value {
        use Value::*;
        match self {
            Message::Hello { name, response } => {
                let mut items = vec![Value::sym("hello"), Value::str(name.clone())];
                if let Some(bytes) = response {
                    items.push(Str(BASE64.encode(bytes)));
                }
                List(items)
            }
            Message::Challenge { salt } => List(vec![
                Value::sym("challenge"),
                Str(BASE64.encode(salt)),
            ]),
            Message::Login { site, session } => List(vec![
                Value::sym("login"),
                Value::int(*site),
                Value::str(session.clone()),
            ]),
            Message::Sync {
                buffer,
                mode,
                content,
                runs,
            } => {
                let mut items = vec![
                    Value::sym("sync"),
                    Value::str(buffer.clone()),
                    match mode {
                        Some(m) => Value::sym(m.clone()),
                        None => Nil,
                    },
                    Value::str(content.clone()),
                ];
                for (len, id, eob) in runs {
                    items.push(List(vec![
                        Value::int(*len as i64),
                        id_value(id),
                        Value::bool(*eob),
                    ]));
                }
                List(items)
            }
            Message::Desync { buffer } => {
                List(vec![Value::sym("desync"), Value::str(buffer.clone())])
            }
            Message::Insert {
                buffer,
                id,
                hint,
                content,
            } => List(vec![
                Value::sym("insert"),
                Value::str(buffer.clone()),
                id_value(id),
                Value::int(*hint as i64),
                Value::str(content.clone()),
            ]),
            Message::Delete {
                buffer,
                hint,
                spans,
            } => {
                let mut items = vec![
                    Value::sym("delete"),
                    Value::str(buffer.clone()),
                    Value::int(*hint as i64),
                ];
                for (len, id) in spans {
                    items.push(List(vec![Value::int(*len as i64), id_value(id)]));
                }
                List(items)
            }
            Message::Cursor {
                buffer,
                site,
                point_hint,
                point,
                mark_hint,
                mark,
            } => List(vec![
                Value::sym("cursor"),
                Value::str(buffer.clone()),
                Value::int(*site),
                Value::int(*point_hint as i64),
                opt_id_value(point),
                Value::int(*mark_hint as i64),
                opt_id_value(mark),
            ]),
            Message::Contact { site, name } => List(vec![
                Value::sym("contact"),
                Value::int(*site),
                match name {
                    Some(n) => Value::str(n.clone()),
                    None => Nil,
                },
            ]),
            Message::Focus { site, buffer } => List(vec![
                Value::sym("focus"),
                Value::int(*site),
                Value::str(buffer.clone()),
            ]),
            Message::OverlayAdd {
                buffer,
                site,
                clock,
                species,
                front_advance,
                rear_advance,
                start_hint,
                start,
                end_hint,
                end,
            } => List(vec![
                Value::sym("overlay-add"),
                Value::str(buffer.clone()),
                Value::int(*site),
                Value::int(*clock),
                Value::sym(species.clone()),
                Value::bool(*front_advance),
                Value::bool(*rear_advance),
                Value::int(*start_hint as i64),
                id_value(start),
                Value::int(*end_hint as i64),
                id_value(end),
            ]),
            Message::OverlayMove {
                buffer,
                site,
                clock,
                start_hint,
                start,
                end_hint,
                end,
            } => List(vec![
                Value::sym("overlay-move"),
                Value::str(buffer.clone()),
                Value::int(*site),
                Value::int(*clock),
                Value::int(*start_hint as i64),
                id_value(start),
                Value::int(*end_hint as i64),
                id_value(end),
            ]),
            Message::OverlayPut {
                buffer,
                site,
                clock,
                prop,
                value,
            } => List(vec![
                Value::sym("overlay-put"),
                Value::str(buffer.clone()),
                Value::int(*site),
                Value::int(*clock),
                Value::sym(prop.clone()),
                value.clone(),
            ]),
            Message::OverlayRemove {
                buffer,
                site,
                clock,
            } => List(vec![
                Value::sym("overlay-remove"),
                Value::str(buffer.clone()),
                Value::int(*site),
                Value::int(*clock),
            ]),
            Message::Get { buffer } => {
                List(vec![Value::sym("get"), Value::str(buffer.clone())])
            }
        }
    }

    /// The printed frame, newline-terminated for stream hygiene.
    pub fn to_frame(&self) -> String {
        format!("{}\n", self.encode())
    }

    pub fn decode(value: Value) -> Result<Message> {
        let items = match value {
            Value::List(items) => items,
            other => {
                return ProtocolSnafu {
                    detail: format!("frame is not a list: {other}"),
                }
                .fail()
            }
        };
        let head = match items.first() {
            Some(Value::Sym(s)) => s.as_str(),
            _ => {
                return ProtocolSnafu {
                    detail: "frame has no type symbol",
                }
                .fail()
            }
        };
        let body = &items[1..];
        match head {
            "hello" => Ok(Message::Hello {
                name: expect_str(arg(body, 0)?)?,
                response: match body.get(1) {
                    None | Some(Value::Nil) => None,
                    Some(v) => Some(expect_bytes(v)?),
                },
            }),
            "challenge" => Ok(Message::Challenge {
                salt: expect_bytes(arg(body, 0)?)?,
            }),
            "login" => Ok(Message::Login {
                site: expect_u16(arg(body, 0)?)?,
                session: expect_str(arg(body, 1)?)?,
            }),
            "sync" => {
                let mut runs = Vec::new();
                for item in body.iter().skip(3) {
                    let fields = expect_list(item)?;
                    runs.push((
                        expect_usize(arg(fields, 0)?)?,
                        expect_id(arg(fields, 1)?)?,
                        fields.get(2).map(Value::is_truthy).unwrap_or(false),
                    ));
                }
                Ok(Message::Sync {
                    buffer: expect_str(arg(body, 0)?)?,
                    mode: match arg(body, 1)? {
                        Value::Nil => None,
                        v => Some(expect_name(v)?),
                    },
                    content: expect_str(arg(body, 2)?)?,
                    runs,
                })
            }
            "desync" => Ok(Message::Desync {
                buffer: expect_str(arg(body, 0)?)?,
            }),
            "insert" => Ok(Message::Insert {
                buffer: expect_str(arg(body, 0)?)?,
                id: expect_id(arg(body, 1)?)?,
                hint: expect_usize(arg(body, 2)?)?,
                content: expect_str(arg(body, 3)?)?,
            }),
            "delete" => {
                let mut spans = Vec::new();
                for item in body.iter().skip(2) {
                    let fields = expect_list(item)?;
                    spans.push((
                        expect_usize(arg(fields, 0)?)?,
                        expect_id(arg(fields, 1)?)?,
                    ));
                }
                Ok(Message::Delete {
                    buffer: expect_str(arg(body, 0)?)?,
                    hint: expect_usize(arg(body, 1)?)?,
                    spans,
                })
            }
            "cursor" => Ok(Message::Cursor {
                buffer: expect_str(arg(body, 0)?)?,
                site: expect_u16(arg(body, 1)?)?,
                point_hint: expect_usize(arg(body, 2)?)?,
                point: expect_opt_id(arg(body, 3)?)?,
                mark_hint: expect_usize(arg(body, 4)?)?,
                mark: expect_opt_id(arg(body, 5)?)?,
            }),
            "contact" => Ok(Message::Contact {
                site: expect_u16(arg(body, 0)?)?,
                name: match arg(body, 1)? {
                    Value::Nil => None,
                    v => Some(expect_str(v)?),
                },
            }),
            "focus" => Ok(Message::Focus {
                site: expect_u16(arg(body, 0)?)?,
                buffer: expect_str(arg(body, 1)?)?,
            }),
            "overlay-add" => Ok(Message::OverlayAdd {
                buffer: expect_str(arg(body, 0)?)?,
                site: expect_u16(arg(body, 1)?)?,
                clock: expect_u32(arg(body, 2)?)?,
                species: expect_name(arg(body, 3)?)?,
                front_advance: arg(body, 4)?.is_truthy(),
                rear_advance: arg(body, 5)?.is_truthy(),
                start_hint: expect_usize(arg(body, 6)?)?,
                start: expect_id(arg(body, 7)?)?,
                end_hint: expect_usize(arg(body, 8)?)?,
                end: expect_id(arg(body, 9)?)?,
            }),
            "overlay-move" => Ok(Message::OverlayMove {
                buffer: expect_str(arg(body, 0)?)?,
                site: expect_u16(arg(body, 1)?)?,
                clock: expect_u32(arg(body, 2)?)?,
                start_hint: expect_usize(arg(body, 3)?)?,
                start: expect_id(arg(body, 4)?)?,
                end_hint: expect_usize(arg(body, 5)?)?,
                end: expect_id(arg(body, 6)?)?,
            }),
            "overlay-put" => Ok(Message::OverlayPut {
                buffer: expect_str(arg(body, 0)?)?,
                site: expect_u16(arg(body, 1)?)?,
                clock: expect_u32(arg(body, 2)?)?,
                prop: expect_name(arg(body, 3)?)?,
                value: arg(body, 4)?.clone(),
            }),
            "overlay-remove" => Ok(Message::OverlayRemove {
                buffer: expect_str(arg(body, 0)?)?,
                site: expect_u16(arg(body, 1)?)?,
                clock: expect_u32(arg(body, 2)?)?,
            }),
            "get" => Ok(Message::Get {
                buffer: expect_str(arg(body, 0)?)?,
            }),
            other => ProtocolSnafu {
                detail: format!("unknown frame type {other:?}"),
            }
            .fail(),
        }
    }
}

fn arg<'v>(body: &'v [Value], index: usize) -> Result<&'v Value> {
    body.get(index).ok_or_else(|| {
        ProtocolSnafu {
            detail: format!("frame too short: missing argument {index}"),
        }
        .build()
    })
}

fn expect_str(v: &Value) -> Result<String> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => ProtocolSnafu {
            detail: format!("expected string, got {other}"),
        }
        .fail(),
    }
}

/// Accepts a symbol or a string; mode and species names arrive as symbols.
fn expect_name(v: &Value) -> Result<String> {
    match v {
        Value::Sym(s) | Value::Str(s) => Ok(s.clone()),
        other => ProtocolSnafu {
            detail: format!("expected name, got {other}"),
        }
        .fail(),
    }
}

fn expect_list(v: &Value) -> Result<&[Value]> {
    match v {
        Value::List(items) => Ok(items),
        other => ProtocolSnafu {
            detail: format!("expected list, got {other}"),
        }
        .fail(),
    }
}

fn expect_int(v: &Value) -> Result<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        other => ProtocolSnafu {
            detail: format!("expected integer, got {other}"),
        }
        .fail(),
    }
}

fn expect_usize(v: &Value) -> Result<usize> {
    let n = expect_int(v)?;
    usize::try_from(n).map_err(|_| {
        ProtocolSnafu {
            detail: format!("expected non-negative integer, got {n}"),
        }
        .build()
    })
}

fn expect_u16(v: &Value) -> Result<u16> {
    let n = expect_int(v)?;
    u16::try_from(n).map_err(|_| {
        ProtocolSnafu {
            detail: format!("site out of range: {n}"),
        }
        .build()
    })
}

fn expect_u32(v: &Value) -> Result<u32> {
    let n = expect_int(v)?;
    u32::try_from(n).map_err(|_| {
        ProtocolSnafu {
            detail: format!("clock out of range: {n}"),
        }
        .build()
    })
}

fn expect_bytes(v: &Value) -> Result<Vec<u8>> {
    let s = expect_str(v)?;
    BASE64.decode(s.as_bytes()).map_err(|_| {
        ProtocolSnafu {
            detail: "invalid base64 payload",
        }
        .build()
    })
}

fn expect_id(v: &Value) -> Result<Id> {
    let bytes = expect_bytes(v)?;
    Id::from_bytes(bytes).ok_or_else(|| {
        ProtocolSnafu {
            detail: "malformed identifier",
        }
        .build()
    })
}

fn expect_opt_id(v: &Value) -> Result<Option<Id>> {
    match v {
        Value::Nil => Ok(None),
        other => expect_id(other).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexp;

    fn test_id(words: &[u16]) -> Id {
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_be_bytes());
        }
        Id::from_bytes(bytes).unwrap()
    }

    fn roundtrip(msg: Message) {
        let frame = msg.to_frame();
        let (value, used) = sexp::read_one(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len() - 1, "frame should parse to the newline");
        assert_eq!(Message::decode(value).unwrap(), msg);
    }

    #[test]
    fn all_shapes_roundtrip() {
        roundtrip(Message::Hello {
            name: "alice".into(),
            response: None,
        });
        roundtrip(Message::Hello {
            name: "alice".into(),
            response: Some(vec![1, 2, 250]),
        });
        roundtrip(Message::Challenge {
            salt: (0u8..32).collect(),
        });
        roundtrip(Message::Login {
            site: 3,
            session: "standup".into(),
        });
        roundtrip(Message::Sync {
            buffer: "notes".into(),
            mode: Some("text-mode".into()),
            content: "HELLO".into(),
            runs: vec![(5, test_id(&[100, 1, 0]), true)],
        });
        roundtrip(Message::Sync {
            buffer: "notes".into(),
            mode: None,
            content: String::new(),
            runs: vec![],
        });
        roundtrip(Message::Desync {
            buffer: "notes".into(),
        });
        roundtrip(Message::Insert {
            buffer: "notes".into(),
            id: test_id(&[100, 1, 0]),
            hint: 7,
            content: "shared \"quoted\" text\n".into(),
        });
        roundtrip(Message::Delete {
            buffer: "notes".into(),
            hint: 2,
            spans: vec![(2, test_id(&[100, 1, 3])), (1, test_id(&[150, 2, 0]))],
        });
        roundtrip(Message::Cursor {
            buffer: "notes".into(),
            site: 2,
            point_hint: 3,
            point: Some(test_id(&[100, 1, 3])),
            mark_hint: 0,
            mark: None,
        });
        roundtrip(Message::Cursor {
            buffer: "notes".into(),
            site: 2,
            point_hint: 9,
            point: Some(Id::empty()),
            mark_hint: 0,
            mark: Some(test_id(&[100, 1, 0])),
        });
        roundtrip(Message::Contact {
            site: 2,
            name: Some("bob".into()),
        });
        roundtrip(Message::Contact {
            site: 2,
            name: None,
        });
        roundtrip(Message::Focus {
            site: 2,
            buffer: "notes".into(),
        });
        roundtrip(Message::OverlayAdd {
            buffer: "notes".into(),
            site: 1,
            clock: 0,
            species: "highlight".into(),
            front_advance: false,
            rear_advance: true,
            start_hint: 0,
            start: test_id(&[100, 1, 0]),
            end_hint: 5,
            end: test_id(&[100, 1, 4]),
        });
        roundtrip(Message::OverlayMove {
            buffer: "notes".into(),
            site: 1,
            clock: 0,
            start_hint: 1,
            start: test_id(&[100, 1, 1]),
            end_hint: 4,
            end: test_id(&[100, 1, 3]),
        });
        roundtrip(Message::OverlayPut {
            buffer: "notes".into(),
            site: 1,
            clock: 0,
            prop: "face".into(),
            value: Value::List(vec![Value::sym("background"), Value::str("gold")]),
        });
        roundtrip(Message::OverlayRemove {
            buffer: "notes".into(),
            site: 1,
            clock: 0,
        });
        roundtrip(Message::Get {
            buffer: "notes".into(),
        });
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let bad = [
            "atom ",
            "(42 \"x\")",
            "(warble \"x\")",
            "(insert \"buf\" \"!!notbase64!!\" 0 \"x\")",
            "(insert \"buf\")",
            "(login -1 \"s\")",
            "(cursor \"buf\" 1 0 \"AAAAAQ==\" 0 nil)",
        ];
        for frame in bad {
            let (value, _) = sexp::read_one(frame).unwrap().unwrap();
            assert!(Message::decode(value).is_err(), "{frame} should not decode");
        }
    }
}
