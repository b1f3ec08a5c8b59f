//! DHCPv6 wire format (RFC 3315/3633 subset used by the relay and server).
//!
//! Client/server messages are `type(1) xid(3) options...`; relay messages are
//! `type(1) hop(1) link(16) peer(16) options...`. All parsing is fail-closed
//! through the cursor; builders assemble options with back-patched lengths.

use std::net::Ipv6Addr;

use super::cursor::{Reader, Writer};

pub const MSG_SOLICIT: u8 = 1;
pub const MSG_ADVERTISE: u8 = 2;
pub const MSG_REQUEST: u8 = 3;
pub const MSG_CONFIRM: u8 = 4;
pub const MSG_RENEW: u8 = 5;
pub const MSG_REBIND: u8 = 6;
pub const MSG_REPLY: u8 = 7;
pub const MSG_RELEASE: u8 = 8;
pub const MSG_DECLINE: u8 = 9;
pub const MSG_RECONFIGURE: u8 = 10;
pub const MSG_INFORMATION_REQUEST: u8 = 11;
pub const MSG_RELAY_FORW: u8 = 12;
pub const MSG_RELAY_REPL: u8 = 13;

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IA_TA: u16 = 4;
pub const OPT_IAADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_RELAY_MSG: u16 = 9;
pub const OPT_AUTH: u16 = 11;
pub const OPT_UNICAST: u16 = 12;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_RAPID_COMMIT: u16 = 14;
pub const OPT_USER_CLASS: u16 = 15;
pub const OPT_VENDOR_CLASS: u16 = 16;
pub const OPT_INTERFACE_ID: u16 = 18;
pub const OPT_RECONF_MSG: u16 = 19;
pub const OPT_RECONF_ACCEPT: u16 = 20;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_DOMAIN_SEARCH: u16 = 24;
pub const OPT_IA_PD: u16 = 25;
pub const OPT_IAPREFIX: u16 = 26;
pub const OPT_INFO_REFRESH: u16 = 32;
pub const OPT_FQDN: u16 = 39;
pub const OPT_PD_EXCLUDE: u16 = 67;
pub const OPT_SOL_MAX_RT: u16 = 82;
pub const OPT_INF_MAX_RT: u16 = 83;

pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_UNSPEC_FAIL: u16 = 1;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;
pub const STATUS_NO_BINDING: u16 = 3;
pub const STATUS_NOT_ON_LINK: u16 = 4;
pub const STATUS_USE_MULTICAST: u16 = 5;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;

/// RFC 3315 §21: authentication protocol and algorithm for reconfigure keys.
pub const AUTH_PROTO_RECONF_KEY: u8 = 3;
pub const AUTH_ALG_HMAC_MD5: u8 = 1;
pub const AUTH_RECONF_TYPE_KEY: u8 = 1;
pub const AUTH_RECONF_TYPE_HMAC: u8 = 2;

/// A client/server message.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub msg_type: u8,
    pub xid: [u8; 3],
    pub options: &'a [u8],
}

/// A RELAY-FORW or RELAY-REPL envelope.
#[derive(Debug, Clone, Copy)]
pub struct RelayMessage<'a> {
    pub msg_type: u8,
    pub hop_count: u8,
    pub link_addr: Ipv6Addr,
    pub peer_addr: Ipv6Addr,
    pub options: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    Message(Message<'a>),
    Relay(RelayMessage<'a>),
}

pub fn parse(buf: &[u8]) -> Option<Packet<'_>> {
    let mut r = Reader::new(buf);
    let msg_type = r.u8()?;
    if msg_type == MSG_RELAY_FORW || msg_type == MSG_RELAY_REPL {
        let hop_count = r.u8()?;
        let link_addr = r.addr6()?;
        let peer_addr = r.addr6()?;
        Some(Packet::Relay(RelayMessage {
            msg_type,
            hop_count,
            link_addr,
            peer_addr,
            options: r.rest(),
        }))
    } else {
        let xid = r.take(3)?;
        Some(Packet::Message(Message {
            msg_type,
            xid: [xid[0], xid[1], xid[2]],
            options: r.rest(),
        }))
    }
}

/// Iterator over `(code, payload)` option pairs; stops at the first
/// length-inconsistent option.
pub struct OptionIter<'a> {
    r: Reader<'a>,
}

impl<'a> OptionIter<'a> {
    pub fn new(options: &'a [u8]) -> Self {
        Self { r: Reader::new(options) }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.r.is_empty() {
            return None;
        }
        let code = self.r.u16()?;
        let len = usize::from(self.r.u16()?);
        let payload = self.r.take(len)?;
        Some((code, payload))
    }
}

pub fn find_option<'a>(options: &'a [u8], code: u16) -> Option<&'a [u8]> {
    OptionIter::new(options).find(|(c, _)| *c == code).map(|(_, p)| p)
}

/// An IA_ADDR suboption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaAddr {
    pub addr: Ipv6Addr,
    pub preferred: u32,
    pub valid: u32,
}

/// An IA_PREFIX suboption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IaPrefix {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub preferred: u32,
    pub valid: u32,
}

/// A parsed IA_NA or IA_PD option from a client message.
#[derive(Debug, Clone)]
pub struct IaRequest {
    pub is_pd: bool,
    pub iaid: u32,
    pub t1: u32,
    pub t2: u32,
    pub addrs: Vec<IaAddr>,
    pub prefixes: Vec<IaPrefix>,
}

impl IaRequest {
    pub fn parse(is_pd: bool, data: &[u8]) -> Option<Self> {
        let mut r = Reader::new(data);
        let iaid = r.u32()?;
        let t1 = r.u32()?;
        let t2 = r.u32()?;
        let mut ia = IaRequest { is_pd, iaid, t1, t2, addrs: Vec::new(), prefixes: Vec::new() };
        for (code, body) in OptionIter::new(r.rest()) {
            let mut s = Reader::new(body);
            match code {
                OPT_IAADDR if !is_pd => {
                    ia.addrs.push(IaAddr {
                        addr: s.addr6()?,
                        preferred: s.u32()?,
                        valid: s.u32()?,
                    });
                }
                OPT_IAPREFIX if is_pd => {
                    let preferred = s.u32()?;
                    let valid = s.u32()?;
                    let prefix_len = s.u8()?;
                    if prefix_len > 128 {
                        return None;
                    }
                    ia.prefixes.push(IaPrefix { prefix: s.addr6()?, prefix_len, preferred, valid });
                }
                _ => {}
            }
        }
        Some(ia)
    }

    /// All IA_NA and IA_PD options of a message, in order.
    pub fn all(options: &[u8]) -> Vec<IaRequest> {
        OptionIter::new(options)
            .filter_map(|(code, body)| match code {
                OPT_IA_NA => IaRequest::parse(false, body),
                OPT_IA_PD => IaRequest::parse(true, body),
                _ => None,
            })
            .collect()
    }
}

/// Builder for client/server messages.
pub struct MessageBuilder {
    w: Writer,
}

impl MessageBuilder {
    pub fn new(msg_type: u8, xid: [u8; 3]) -> Self {
        let mut w = Writer::new();
        w.u8(msg_type);
        w.slice(&xid);
        Self { w }
    }

    pub fn option(&mut self, code: u16, payload: &[u8]) -> &mut Self {
        self.w.u16(code);
        self.w.u16(payload.len() as u16);
        self.w.slice(payload);
        self
    }

    /// Open a nested option; write its payload through [`Self::writer`] and
    /// close it with [`Self::end_option`].
    pub fn begin_option(&mut self, code: u16) -> usize {
        self.w.u16(code);
        self.w.reserve_u16()
    }

    pub fn end_option(&mut self, pos: usize) {
        let len = self.w.len() - pos - 2;
        self.w.patch_u16(pos, len as u16);
    }

    pub fn writer(&mut self) -> &mut Writer {
        &mut self.w
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.into_vec()
    }
}

/// Status Code option payload.
pub fn status_payload(code: u16, msg: &str) -> Vec<u8> {
    let mut w = Writer::new();
    w.u16(code);
    w.slice(msg.as_bytes());
    w.into_vec()
}

pub fn parse_status(body: &[u8]) -> Option<u16> {
    Reader::new(body).u16()
}

/// Build a RELAY-FORW envelope around `inner`, tagging it with the receiving
/// interface index so the reply can be routed back.
pub fn build_relay_forward(
    hop_count: u8,
    link_addr: Ipv6Addr,
    peer_addr: Ipv6Addr,
    interface_id: u32,
    inner: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(MSG_RELAY_FORW);
    w.u8(hop_count);
    w.addr6(link_addr);
    w.addr6(peer_addr);
    w.u16(OPT_INTERFACE_ID);
    w.u16(4);
    w.u32(interface_id);
    w.u16(OPT_RELAY_MSG);
    w.u16(inner.len() as u16);
    w.slice(inner);
    w.into_vec()
}

/// The parts of a RELAY-REPL needed to route the embedded reply.
#[derive(Debug, Clone, Copy)]
pub struct RelayReply<'a> {
    pub peer_addr: Ipv6Addr,
    pub interface_id: Option<u32>,
    pub inner: &'a [u8],
}

impl<'a> RelayReply<'a> {
    pub fn parse(relay: &RelayMessage<'a>) -> Option<Self> {
        if relay.msg_type != MSG_RELAY_REPL {
            return None;
        }
        let inner = find_option(relay.options, OPT_RELAY_MSG)?;
        let interface_id =
            find_option(relay.options, OPT_INTERFACE_ID).and_then(|b| Reader::new(b).u32());
        Some(Self { peer_addr: relay.peer_addr, interface_id, inner })
    }
}

/// Replace the DNS-server list of an embedded reply with `addr`. Returns
/// `None` when the message is authenticated (rewriting would invalidate the
/// signature) or malformed; the caller then forwards the original bytes.
pub fn rewrite_dns_servers(inner: &[u8], addr: Ipv6Addr) -> Option<Vec<u8>> {
    let Packet::Message(msg) = parse(inner)? else {
        return None;
    };
    if find_option(msg.options, OPT_AUTH).is_some() {
        return None;
    }
    if find_option(msg.options, OPT_DNS_SERVERS).is_none() {
        return None;
    }
    let mut b = MessageBuilder::new(msg.msg_type, msg.xid);
    for (code, body) in OptionIter::new(msg.options) {
        if code == OPT_DNS_SERVERS {
            b.option(code, &addr.octets());
        } else {
            b.option(code, body);
        }
    }
    Some(b.finish())
}

/// Authentication option payload carrying a fresh reconfigure key.
pub fn auth_reconf_key_payload(replay: u64, key: &[u8; 16]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(AUTH_PROTO_RECONF_KEY);
    w.u8(AUTH_ALG_HMAC_MD5);
    w.u8(0); // RDM: monotonic counter
    w.slice(&replay.to_be_bytes());
    w.u8(AUTH_RECONF_TYPE_KEY);
    w.slice(key);
    w.into_vec()
}

/// Authentication option payload for a RECONFIGURE message, digest zeroed.
/// The HMAC-MD5 over the full message is patched into the final 16 bytes.
pub fn auth_reconf_hmac_payload(replay: u64) -> Vec<u8> {
    let mut w = Writer::new();
    w.u8(AUTH_PROTO_RECONF_KEY);
    w.u8(AUTH_ALG_HMAC_MD5);
    w.u8(0);
    w.slice(&replay.to_be_bytes());
    w.u8(AUTH_RECONF_TYPE_HMAC);
    w.slice(&[0u8; 16]);
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solicit_with_ia_pd() -> Vec<u8> {
        let mut b = MessageBuilder::new(MSG_SOLICIT, [1, 2, 3]);
        b.option(OPT_CLIENTID, &[0, 1, 0, 1, 0, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let ia = b.begin_option(OPT_IA_PD);
        b.writer().u32(0x10);
        b.writer().u32(0);
        b.writer().u32(0);
        let hint = b.begin_option(OPT_IAPREFIX);
        b.writer().u32(3600);
        b.writer().u32(7200);
        b.writer().u8(60);
        b.writer().addr6("2001:db8:1::".parse().unwrap());
        b.end_option(hint);
        b.end_option(ia);
        b.finish()
    }

    #[test]
    fn test_message_roundtrip() {
        let buf = solicit_with_ia_pd();
        let Some(Packet::Message(msg)) = parse(&buf) else {
            panic!("expected message");
        };
        assert_eq!(msg.msg_type, MSG_SOLICIT);
        assert_eq!(msg.xid, [1, 2, 3]);
        assert!(find_option(msg.options, OPT_CLIENTID).is_some());

        let ias = IaRequest::all(msg.options);
        assert_eq!(ias.len(), 1);
        assert!(ias[0].is_pd);
        assert_eq!(ias[0].iaid, 0x10);
        assert_eq!(ias[0].prefixes[0].prefix_len, 60);
    }

    #[test]
    fn test_truncated_options_fail_closed() {
        let buf = solicit_with_ia_pd();
        // Chopping the buffer anywhere must never panic and never yield an
        // option that reads past the end.
        for cut in 0..buf.len() {
            if let Some(Packet::Message(msg)) = parse(&buf[..cut]) {
                for (_, body) in OptionIter::new(msg.options) {
                    assert!(body.len() <= cut);
                }
                let _ = IaRequest::all(msg.options);
            }
        }
    }

    #[test]
    fn test_option_length_overrun() {
        // Option claims 100 bytes of payload but only 2 follow.
        let mut b = MessageBuilder::new(MSG_REQUEST, [0, 0, 0]);
        b.option(OPT_ORO, &[0, 3]);
        let mut buf = b.finish();
        buf[6] = 100;
        let Some(Packet::Message(msg)) = parse(&buf) else {
            panic!("expected message");
        };
        assert_eq!(OptionIter::new(msg.options).count(), 0);
    }

    #[test]
    fn test_relay_forward_roundtrip() {
        let inner = solicit_with_ia_pd();
        let link: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let peer: Ipv6Addr = "fe80::2".parse().unwrap();
        let buf = build_relay_forward(0, link, peer, 7, &inner);

        let Some(Packet::Relay(relay)) = parse(&buf) else {
            panic!("expected relay");
        };
        assert_eq!(relay.msg_type, MSG_RELAY_FORW);
        assert_eq!(relay.hop_count, 0);
        assert_eq!(relay.link_addr, link);
        assert_eq!(relay.peer_addr, peer);
        assert_eq!(find_option(relay.options, OPT_RELAY_MSG), Some(inner.as_slice()));
        assert_eq!(find_option(relay.options, OPT_INTERFACE_ID), Some(&[0, 0, 0, 7][..]));
    }

    #[test]
    fn test_dns_rewrite_refused_when_authenticated() {
        let dns: Ipv6Addr = "2001:db8::53".parse().unwrap();
        let mut b = MessageBuilder::new(MSG_REPLY, [9, 9, 9]);
        b.option(OPT_DNS_SERVERS, &dns.octets());
        b.option(OPT_AUTH, &auth_reconf_key_payload(1, &[0u8; 16]));
        let buf = b.finish();
        assert!(rewrite_dns_servers(&buf, "fd00::1".parse().unwrap()).is_none());

        let mut b = MessageBuilder::new(MSG_REPLY, [9, 9, 9]);
        b.option(OPT_DNS_SERVERS, &dns.octets());
        let buf = b.finish();
        let out = rewrite_dns_servers(&buf, "fd00::1".parse().unwrap()).unwrap();
        let Some(Packet::Message(msg)) = parse(&out) else {
            panic!("expected message");
        };
        assert_eq!(
            find_option(msg.options, OPT_DNS_SERVERS),
            Some(&"fd00::1".parse::<Ipv6Addr>().unwrap().octets()[..])
        );
    }
}
