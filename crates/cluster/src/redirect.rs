//! MOVED / ASK redirection replies

/// Redirection sent by a node that does not own a key's slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// `MOVED <slot> <host:port>`: the slot now lives on another node
    Moved { slot: u32, addr: String },
    /// `ASK <slot> <host:port>`: slot is migrating, retry once there after `ASKING`
    Ask { slot: u32, addr: String },
}

impl Redirect {
    /// Parse a server error message; `None` if it is not a redirect
    pub fn parse(msg: &str) -> Option<Self> {
        let mut parts = msg.split_whitespace();
        let kind = parts.next()?;
        let slot = parts.next()?.parse().ok()?;
        let addr = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        match kind {
            "MOVED" => Some(Redirect::Moved { slot, addr }),
            "ASK" => Some(Redirect::Ask { slot, addr }),
            _ => None,
        }
    }

    pub fn addr(&self) -> &str {
        match self {
            Redirect::Moved { addr, .. } | Redirect::Ask { addr, .. } => addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved() {
        assert_eq!(
            Redirect::parse("MOVED 3999 127.0.0.1:6381"),
            Some(Redirect::Moved {
                slot: 3999,
                addr: "127.0.0.1:6381".to_string()
            })
        );
    }

    #[test]
    fn test_parse_ask() {
        let r = Redirect::parse("ASK 12182 10.0.0.2:7001").unwrap();
        assert!(matches!(r, Redirect::Ask { slot: 12182, .. }));
        assert_eq!(r.addr(), "10.0.0.2:7001");
    }

    #[test]
    fn test_not_a_redirect() {
        assert_eq!(Redirect::parse("ERR unknown command"), None);
        assert_eq!(Redirect::parse("MOVED notaslot 1.2.3.4:5"), None);
        assert_eq!(Redirect::parse("MOVED 1"), None);
        assert_eq!(Redirect::parse("CROSSSLOT Keys in request don't hash to the same slot"), None);
    }
}
