//! Message build/parse glue over the DNS protocol crate.
//!
//! The engine delegates all wire-format knowledge to `hickory-proto`;
//! this module adds the pieces around it: reverse-name synthesis, query
//! name case randomization (0x20 encoding), and the mapping from reply
//! codes onto the crate's numeric code space.

use super::error::code;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use std::net::IpAddr;

/// Lookup kinds accepted by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// IPv4 addresses for a hostname.
    A,
    /// IPv6 addresses for a hostname.
    Aaaa,
    /// Reverse lookup of an IPv4 literal.
    ReverseA,
    /// Reverse lookup of an IPv6 literal.
    ReverseAaaa,
}

impl QueryKind {
    pub(crate) fn record_type(self) -> RecordType {
        match self {
            Self::A => RecordType::A,
            Self::Aaaa => RecordType::AAAA,
            Self::ReverseA | Self::ReverseAaaa => RecordType::PTR,
        }
    }

    /// True for the reverse (PTR) kinds.
    #[must_use]
    pub fn is_reverse(self) -> bool {
        matches!(self, Self::ReverseA | Self::ReverseAaaa)
    }
}

/// Synthesizes the reverse-lookup name for an address literal.
pub(crate) fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa.")
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push(char::from_digit(u32::from(byte & 0x0f), 16).expect("nibble"));
                name.push('.');
                name.push(char::from_digit(u32::from(byte >> 4), 16).expect("nibble"));
                name.push('.');
            }
            name.push_str("ip6.arpa.");
            name
        }
    }
}

/// Randomizes the ASCII case of a query name (0x20 encoding). The reply
/// must echo the randomized spelling, which defeats blind spoofing.
pub(crate) fn randomize_case(name: &str, rng: &mut impl Rng) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphabetic() && rng.gen_bool(0.5) {
                if c.is_ascii_lowercase() {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            } else {
                c
            }
        })
        .collect()
}

/// Appends the root dot so relative and absolute spellings of the same
/// name encode identically.
pub(crate) fn to_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Encodes one recursive query.
pub(crate) fn build_query(id: u16, qname: &str, kind: QueryKind) -> Option<Vec<u8>> {
    let name = Name::from_ascii(qname).ok()?;
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, kind.record_type()));
    message.to_vec().ok()
}

/// A decoded reply, reduced to what the engine consumes.
#[derive(Debug)]
pub(crate) struct ParsedReply {
    pub(crate) id: u16,
    /// Question name exactly as echoed (case preserved).
    pub(crate) qname: String,
    /// Reply outcome in the crate's numeric code space.
    pub(crate) code: i32,
    pub(crate) ttl: u32,
    pub(crate) addrs: Vec<IpAddr>,
    pub(crate) names: Vec<String>,
}

/// Decodes a reply datagram. `None` means the datagram was not a
/// well-formed response and should be ignored.
pub(crate) fn parse_reply(buf: &[u8]) -> Option<ParsedReply> {
    let message = Message::from_vec(buf).ok()?;
    if message.message_type() != MessageType::Response {
        return None;
    }
    let qname = message.queries().first()?.name().to_ascii();

    let mut code_value = match message.response_code() {
        ResponseCode::NoError => code::NONE,
        ResponseCode::FormErr => code::FORMAT,
        ResponseCode::ServFail => code::SERVER_FAILED,
        ResponseCode::NXDomain => code::NOT_EXIST,
        ResponseCode::NotImp => code::NOT_IMPL,
        ResponseCode::Refused => code::REFUSED,
        _ => code::UNKNOWN,
    };
    if code_value == code::NONE && message.truncated() {
        code_value = code::TRUNCATED;
    }

    let mut addrs = Vec::new();
    let mut names = Vec::new();
    let mut ttl = None;
    if code_value == code::NONE {
        for record in message.answers() {
            match record.data() {
                Some(RData::A(a)) => addrs.push(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6(aaaa.0)),
                Some(RData::PTR(ptr)) => names.push(ptr.0.to_ascii()),
                _ => continue,
            }
            ttl.get_or_insert(record.ttl());
        }
    }

    Some(ParsedReply {
        id: message.id(),
        qname,
        code: code_value,
        ttl: ttl.unwrap_or(0),
        addrs,
        names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, PTR};
    use hickory_proto::rr::Record;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::str::FromStr;

    #[test]
    fn reverse_name_v4() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(reverse_name(ip), "3.2.1.10.in-addr.arpa.");
    }

    #[test]
    fn reverse_name_v6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let name = reverse_name(ip);
        assert!(name.ends_with("ip6.arpa."));
        // 32 nibbles, each followed by a dot, before the suffix.
        assert_eq!(name.len(), 32 * 2 + "ip6.arpa.".len());
        assert!(name.starts_with("1.0.0.0."));
    }

    #[test]
    fn randomize_case_preserves_letters() {
        let mut rng = StdRng::seed_from_u64(7);
        let original = "www.example.com.";
        let randomized = randomize_case(original, &mut rng);
        assert_eq!(randomized.len(), original.len());
        assert!(randomized.eq_ignore_ascii_case(original));
        // Dots and digits are untouched.
        assert_eq!(
            randomized.match_indices('.').count(),
            original.match_indices('.').count()
        );
    }

    #[test]
    fn query_roundtrips_through_parse() {
        let wire = build_query(0x1234, "example.com.", QueryKind::A).expect("encode");
        // A query is not a response; the parser must reject it.
        assert!(parse_reply(&wire).is_none());

        let mut message = Message::from_vec(&wire).expect("decode");
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            300,
            RData::A(A("93.184.216.34".parse().unwrap())),
        ));
        let reply = parse_reply(&message.to_vec().expect("encode reply")).expect("parse");
        assert_eq!(reply.id, 0x1234);
        assert_eq!(reply.code, code::NONE);
        assert_eq!(reply.ttl, 300);
        assert_eq!(reply.addrs, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert!(reply.names.is_empty());
        assert!(reply.qname.eq_ignore_ascii_case("example.com."));
    }

    #[test]
    fn nxdomain_maps_to_not_exist() {
        let wire = build_query(7, "missing.example.", QueryKind::A).expect("encode");
        let mut message = Message::from_vec(&wire).expect("decode");
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NXDomain);
        let reply = parse_reply(&message.to_vec().expect("encode")).expect("parse");
        assert_eq!(reply.code, code::NOT_EXIST);
        assert!(reply.addrs.is_empty());
    }

    #[test]
    fn ptr_answers_land_in_names() {
        let wire = build_query(9, "4.3.2.1.in-addr.arpa.", QueryKind::ReverseA).expect("encode");
        let mut message = Message::from_vec(&wire).expect("decode");
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            Name::from_str("4.3.2.1.in-addr.arpa.").unwrap(),
            600,
            RData::PTR(PTR(Name::from_str("host.example.com.").unwrap())),
        ));
        let reply = parse_reply(&message.to_vec().expect("encode")).expect("parse");
        assert_eq!(reply.names, vec!["host.example.com.".to_string()]);
        assert!(reply.addrs.is_empty());
    }

    #[test]
    fn to_fqdn_appends_root_dot_once() {
        assert_eq!(to_fqdn("example.com"), "example.com.");
        assert_eq!(to_fqdn("example.com."), "example.com.");
    }
}
