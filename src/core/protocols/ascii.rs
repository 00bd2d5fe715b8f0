use super::ProtocolError;

/// Storage command flavours sharing the `<cmd> key flags exptime bytes` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

impl StoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
        }
    }
}

/// ASCII protocol command types
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiCommand {
    Get {
        keys: Vec<String>,
    },
    MetaGet {
        key: String,
    },
    LeaseGet {
        keys: Vec<String>,
    },
    Store {
        mode: StoreMode,
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },
    LeaseSet {
        key: String,
        token: u64,
        flags: u32,
        exptime: u32,
        bytes: usize,
    },
    Delete {
        key: String,
        noreply: bool,
    },
    Incr {
        key: String,
        value: u64,
        noreply: bool,
    },
    Decr {
        key: String,
        value: u64,
        noreply: bool,
    },
    Stats {
        args: Option<String>,
    },
    Version,
    Shutdown,
}

/// ASCII protocol response line types
#[derive(Debug, Clone, PartialEq)]
pub enum AsciiResponse {
    Value {
        key: String,
        flags: u32,
        bytes: usize,
    },
    LeaseValue {
        key: String,
        token: u64,
        flags: u32,
        bytes: usize,
    },
    Meta {
        key: String,
        fields: Vec<(String, String)>,
    },
    Stored,
    StaleStored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    Error(String),
    ClientError(String),
    ServerError(String),
    Stat {
        key: String,
        value: String,
    },
    Version(String),
    Number(u64),
    End,
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, ProtocolError> {
    s.parse::<T>()
        .map_err(|_| ProtocolError::ParseError(format!("Invalid {}", what)))
}

fn noreply_suffix(noreply: bool) -> &'static str {
    if noreply {
        " noreply"
    } else {
        ""
    }
}

impl AsciiCommand {
    /// Parse an ASCII command from a line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(ProtocolError::ParseError("Empty command".to_string()));
        }

        let command = parts[0].to_lowercase();
        match command.as_str() {
            "get" | "lease-get" => {
                if parts.len() < 2 {
                    return Err(ProtocolError::ParseError(format!(
                        "{} requires at least one key",
                        command
                    )));
                }
                let keys = parts[1..].iter().map(|s| s.to_string()).collect();
                if command == "get" {
                    Ok(AsciiCommand::Get { keys })
                } else {
                    Ok(AsciiCommand::LeaseGet { keys })
                }
            }
            "metaget" => {
                if parts.len() < 2 {
                    return Err(ProtocolError::ParseError("metaget requires key".to_string()));
                }
                Ok(AsciiCommand::MetaGet {
                    key: parts[1].to_string(),
                })
            }
            "set" | "add" | "replace" => {
                if parts.len() < 5 {
                    return Err(ProtocolError::ParseError(format!(
                        "{} requires key, flags, exptime, bytes",
                        command
                    )));
                }
                let mode = match command.as_str() {
                    "set" => StoreMode::Set,
                    "add" => StoreMode::Add,
                    _ => StoreMode::Replace,
                };
                Ok(AsciiCommand::Store {
                    mode,
                    key: parts[1].to_string(),
                    flags: parse_num(parts[2], "flags")?,
                    exptime: parse_num(parts[3], "exptime")?,
                    bytes: parse_num(parts[4], "bytes")?,
                    noreply: parts.len() > 5 && parts[5] == "noreply",
                })
            }
            "lease-set" => {
                if parts.len() < 6 {
                    return Err(ProtocolError::ParseError(
                        "lease-set requires key, token, flags, exptime, bytes".to_string(),
                    ));
                }
                Ok(AsciiCommand::LeaseSet {
                    key: parts[1].to_string(),
                    token: parse_num(parts[2], "token")?,
                    flags: parse_num(parts[3], "flags")?,
                    exptime: parse_num(parts[4], "exptime")?,
                    bytes: parse_num(parts[5], "bytes")?,
                })
            }
            "delete" => {
                if parts.len() < 2 {
                    return Err(ProtocolError::ParseError("delete requires key".to_string()));
                }
                Ok(AsciiCommand::Delete {
                    key: parts[1].to_string(),
                    noreply: parts.len() > 2 && parts[2] == "noreply",
                })
            }
            "incr" | "decr" => {
                if parts.len() < 3 {
                    return Err(ProtocolError::ParseError(format!(
                        "{} requires key and value",
                        command
                    )));
                }
                let key = parts[1].to_string();
                let value = parse_num(parts[2], "value")?;
                let noreply = parts.len() > 3 && parts[3] == "noreply";
                if command == "incr" {
                    Ok(AsciiCommand::Incr {
                        key,
                        value,
                        noreply,
                    })
                } else {
                    Ok(AsciiCommand::Decr {
                        key,
                        value,
                        noreply,
                    })
                }
            }
            "stats" => {
                let args = if parts.len() > 1 {
                    Some(parts[1..].join(" "))
                } else {
                    None
                };
                Ok(AsciiCommand::Stats { args })
            }
            "version" => Ok(AsciiCommand::Version),
            "shutdown" => Ok(AsciiCommand::Shutdown),
            _ => Err(ProtocolError::ParseError(format!(
                "Unknown command: {}",
                command
            ))),
        }
    }

    /// Encode the request line, followed by the data block for storage commands
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let line = match self {
            AsciiCommand::Get { keys } => format!("get {}\r\n", keys.join(" ")),
            AsciiCommand::MetaGet { key } => format!("metaget {}\r\n", key),
            AsciiCommand::LeaseGet { keys } => format!("lease-get {}\r\n", keys.join(" ")),
            AsciiCommand::Store {
                mode,
                key,
                flags,
                exptime,
                bytes,
                noreply,
            } => format!(
                "{} {} {} {} {}{}\r\n",
                mode.as_str(),
                key,
                flags,
                exptime,
                bytes,
                noreply_suffix(*noreply)
            ),
            AsciiCommand::LeaseSet {
                key,
                token,
                flags,
                exptime,
                bytes,
            } => format!(
                "lease-set {} {} {} {} {}\r\n",
                key, token, flags, exptime, bytes
            ),
            AsciiCommand::Delete { key, noreply } => {
                format!("delete {}{}\r\n", key, noreply_suffix(*noreply))
            }
            AsciiCommand::Incr {
                key,
                value,
                noreply,
            } => format!("incr {} {}{}\r\n", key, value, noreply_suffix(*noreply)),
            AsciiCommand::Decr {
                key,
                value,
                noreply,
            } => format!("decr {} {}{}\r\n", key, value, noreply_suffix(*noreply)),
            AsciiCommand::Stats { args } => match args {
                Some(a) => format!("stats {}\r\n", a),
                None => "stats\r\n".to_string(),
            },
            AsciiCommand::Version => "version\r\n".to_string(),
            AsciiCommand::Shutdown => "shutdown\r\n".to_string(),
        };

        let mut out = line.into_bytes();
        if self.data_len().is_some() {
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Length of the data block that follows the command line, if any
    pub fn data_len(&self) -> Option<usize> {
        match self {
            AsciiCommand::Store { bytes, .. } | AsciiCommand::LeaseSet { bytes, .. } => {
                Some(*bytes)
            }
            _ => None,
        }
    }

    /// Check if this command expects a response
    pub fn expects_response(&self) -> bool {
        match self {
            AsciiCommand::Store { noreply, .. } => !noreply,
            AsciiCommand::Delete { noreply, .. } => !noreply,
            AsciiCommand::Incr { noreply, .. } => !noreply,
            AsciiCommand::Decr { noreply, .. } => !noreply,
            _ => true,
        }
    }
}

impl AsciiResponse {
    /// Parse an ASCII response from a line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();

        if line.starts_with("VALUE ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(ProtocolError::ParseError(
                    "Invalid VALUE response".to_string(),
                ));
            }
            Ok(AsciiResponse::Value {
                key: parts[1].to_string(),
                flags: parse_num(parts[2], "flags")?,
                bytes: parse_num(parts[3], "bytes")?,
            })
        } else if line.starts_with("LVALUE ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return Err(ProtocolError::ParseError(
                    "Invalid LVALUE response".to_string(),
                ));
            }
            Ok(AsciiResponse::LeaseValue {
                key: parts[1].to_string(),
                token: parse_num(parts[2], "token")?,
                flags: parse_num(parts[3], "flags")?,
                bytes: parse_num(parts[4], "bytes")?,
            })
        } else if line.starts_with("META ") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                return Err(ProtocolError::ParseError("Invalid META response".to_string()));
            }
            // META <key> <field>: <value>; <field>: <value> ...
            let fields = (1..parts.len() / 2)
                .map(|i| {
                    (
                        parts[2 * i].trim_end_matches(':').to_string(),
                        parts[2 * i + 1].trim_end_matches(';').to_string(),
                    )
                })
                .collect();
            Ok(AsciiResponse::Meta {
                key: parts[1].to_string(),
                fields,
            })
        } else {
            match line {
                "STORED" => Ok(AsciiResponse::Stored),
                "STALE_STORED" => Ok(AsciiResponse::StaleStored),
                "NOT_STORED" => Ok(AsciiResponse::NotStored),
                "EXISTS" => Ok(AsciiResponse::Exists),
                "NOT_FOUND" => Ok(AsciiResponse::NotFound),
                "DELETED" => Ok(AsciiResponse::Deleted),
                "OK" => Ok(AsciiResponse::Ok),
                "END" => Ok(AsciiResponse::End),
                _ if line.starts_with("ERROR") => Ok(AsciiResponse::Error(line.to_string())),
                _ if line.starts_with("CLIENT_ERROR") => {
                    Ok(AsciiResponse::ClientError(line.to_string()))
                }
                _ if line.starts_with("SERVER_ERROR") => {
                    Ok(AsciiResponse::ServerError(line.to_string()))
                }
                _ if line.starts_with("STAT ") => {
                    let parts: Vec<&str> = line.splitn(3, ' ').collect();
                    if parts.len() >= 3 {
                        Ok(AsciiResponse::Stat {
                            key: parts[1].to_string(),
                            value: parts[2].to_string(),
                        })
                    } else {
                        Err(ProtocolError::ParseError(
                            "Invalid STAT response".to_string(),
                        ))
                    }
                }
                _ if line.starts_with("VERSION ") => {
                    let version = line.strip_prefix("VERSION ").unwrap_or("").to_string();
                    Ok(AsciiResponse::Version(version))
                }
                _ if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) => {
                    Ok(AsciiResponse::Number(parse_num(line, "number")?))
                }
                _ => Err(ProtocolError::ParseError(format!(
                    "Unknown response: {}",
                    line
                ))),
            }
        }
    }

    /// Format this response as ASCII protocol string (data blocks are written separately)
    pub fn format(&self) -> String {
        match self {
            AsciiResponse::Value { key, flags, bytes } => {
                format!("VALUE {} {} {}\r\n", key, flags, bytes)
            }
            AsciiResponse::LeaseValue {
                key,
                token,
                flags,
                bytes,
            } => format!("LVALUE {} {} {} {}\r\n", key, token, flags, bytes),
            AsciiResponse::Meta { key, fields } => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|(field, value)| format!("{}: {}", field, value))
                    .collect();
                format!("META {} {}\r\n", key, fields.join("; "))
            }
            AsciiResponse::Stored => "STORED\r\n".to_string(),
            AsciiResponse::StaleStored => "STALE_STORED\r\n".to_string(),
            AsciiResponse::NotStored => "NOT_STORED\r\n".to_string(),
            AsciiResponse::Exists => "EXISTS\r\n".to_string(),
            AsciiResponse::NotFound => "NOT_FOUND\r\n".to_string(),
            AsciiResponse::Deleted => "DELETED\r\n".to_string(),
            AsciiResponse::Ok => "OK\r\n".to_string(),
            AsciiResponse::End => "END\r\n".to_string(),
            AsciiResponse::Error(msg) => format!("{}\r\n", msg),
            AsciiResponse::ClientError(msg) => format!("{}\r\n", msg),
            AsciiResponse::ServerError(msg) => format!("{}\r\n", msg),
            AsciiResponse::Stat { key, value } => format!("STAT {} {}\r\n", key, value),
            AsciiResponse::Version(version) => format!("VERSION {}\r\n", version),
            AsciiResponse::Number(n) => format!("{}\r\n", n),
        }
    }
}
