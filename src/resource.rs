//! Typed RDATA for the record types the proxy decodes, and opaque carriage
//! for the ones it doesn't.

use crate::bail;
use crate::dns::write_qname;
use crate::io::DNSReadExt;
use crate::types::{Class, Record, Resource, Type};
use byteorder::{ReadBytesExt, BE};
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// IPv4 Address record.
#[derive(Clone, Debug, PartialEq)]
pub struct A(pub Ipv4Addr);

/// IPv6 Address record.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct AAAA(pub Ipv6Addr);

/// Canonical name record.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct CNAME(pub String);

/// Authoritative name server record.
#[derive(Clone, Debug, PartialEq)]
pub struct NS(pub String);

/// Domain name pointer record.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct PTR(pub String);

/// Text record, one entry per character-string.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct TXT(pub Vec<String>);

/// Mail exchange record.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct MX {
    /// Preference given to this RR among others at the same owner. Lower
    /// values are preferred.
    pub preference: u16,

    /// A host willing to act as a mail exchange for the owner name.
    pub exchange: String,
}

/// Start of authority record.
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct SOA {
    /// The name server that was the original or primary source of data for this zone.
    pub mname: String,

    /// The mailbox of the person responsible for this zone.
    pub rname: String,

    pub serial: u32,
    pub refresh: u32, // in seconds
    pub retry: u32,   // in seconds
    pub expire: u32,  // in seconds
    pub minimum: u32, // in seconds
}

/// Server selection record. See [rfc2782].
///
/// [rfc2782]: https://datatracker.ietf.org/doc/html/rfc2782
#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
pub struct SRV {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub name: String,
}

/// RDATA kept verbatim for types without a structured decode.
///
/// Invariant: only types whose RDATA is compression-free (RFC 3597 §4) are
/// stored this way, so the bytes stay valid when the message around them is
/// re-encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Opaque {
    pub r#type: Type,
    pub data: Vec<u8>,
}

impl Record {
    /// Parses the remainder of a resource record (TTL, RDLENGTH and RDATA).
    /// The name, type and class have already been consumed by the caller.
    ///
    /// The cursor must span the full message, so compressed names inside
    /// RDATA can follow their pointers.
    pub(crate) fn parse(
        cur: &mut Cursor<&[u8]>,
        name: String,
        r#type: Type,
        class: Class,
    ) -> io::Result<Record> {
        let ttl = cur.read_u32::<BE>()?;
        let rd_len = cur.read_u16::<BE>()? as u64;

        let rd_start = cur.position();
        let resource = Resource::parse(cur, r#type, rd_len)?;

        if cur.position() != rd_start + rd_len {
            bail!(
                InvalidData,
                "{} record used {} bytes of a {} byte RDATA",
                r#type,
                cur.position() - rd_start,
                rd_len
            );
        }

        Ok(Record {
            name,
            class,
            ttl: Duration::new(ttl.into(), 0),
            resource,
        })
    }

    /// Encodes the full record (name, type, class, TTL, RDLENGTH, RDATA).
    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        write_qname(buf, &self.name)?;

        buf.extend_from_slice(&(self.r#type() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.class as u16).to_be_bytes());
        buf.extend_from_slice(&(self.ttl.as_secs() as u32).to_be_bytes());

        // RDLENGTH is backpatched once the RDATA has been written.
        let len_at = buf.len();
        buf.extend_from_slice(&[0, 0]);

        self.resource.write(buf)?;

        let rd_len = buf.len() - len_at - 2;
        if rd_len > u16::MAX as usize {
            bail!(InvalidData, "RDATA longer than 65535 bytes");
        }
        buf[len_at..len_at + 2].copy_from_slice(&(rd_len as u16).to_be_bytes());

        Ok(())
    }
}

impl Resource {
    fn parse(cur: &mut Cursor<&[u8]>, r#type: Type, rd_len: u64) -> io::Result<Resource> {
        Ok(match r#type {
            Type::A => Resource::A(A(Ipv4Addr::from(read_octets(cur)?))),
            Type::AAAA => Resource::AAAA(AAAA(Ipv6Addr::from(read_octets::<16>(cur)?))),

            Type::CNAME => Resource::CNAME(CNAME(cur.read_qname()?)),
            Type::NS => Resource::NS(NS(cur.read_qname()?)),
            Type::PTR => Resource::PTR(PTR(cur.read_qname()?)),

            Type::TXT => Resource::TXT(TXT(parse_txt(cur, rd_len)?)),

            Type::MX => Resource::MX(MX {
                preference: cur.read_u16::<BE>()?,
                exchange: cur.read_qname()?,
            }),

            Type::SOA => Resource::SOA(SOA {
                mname: cur.read_qname()?,
                rname: cur.read_qname()?,
                serial: cur.read_u32::<BE>()?,
                refresh: cur.read_u32::<BE>()?,
                retry: cur.read_u32::<BE>()?,
                expire: cur.read_u32::<BE>()?,
                minimum: cur.read_u32::<BE>()?,
            }),

            Type::SRV => Resource::SRV(SRV {
                priority: cur.read_u16::<BE>()?,
                weight: cur.read_u16::<BE>()?,
                port: cur.read_u16::<BE>()?,
                name: cur.read_qname()?,
            }),

            // RFC 3597 unknown-type handling for the types we don't decode.
            // Their RDATA is compression-free, so verbatim bytes stay valid.
            Type::DS
            | Type::RRSIG
            | Type::NSEC
            | Type::DNSKEY
            | Type::SVCB
            | Type::HTTPS
            | Type::CAA
            | Type::Reserved => {
                let mut data = vec![0; rd_len as usize];
                cur.read_exact(&mut data)?;
                Resource::Opaque(Opaque { r#type, data })
            }

            // This should never happen unless we have invalid data.
            Type::ANY => Resource::ANY,

            // The OPT pseudo-record is hoisted into Message::extension by
            // the message parser and never reaches here.
            Type::OPT => bail!(InvalidData, "OPT record outside the additional section"),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Resource::A(A(ip)) => buf.extend_from_slice(&ip.octets()),
            Resource::AAAA(AAAA(ip)) => buf.extend_from_slice(&ip.octets()),

            Resource::CNAME(CNAME(name)) => write_qname(buf, name)?,
            Resource::NS(NS(name)) => write_qname(buf, name)?,
            Resource::PTR(PTR(name)) => write_qname(buf, name)?,

            Resource::TXT(TXT(txts)) => {
                for txt in txts {
                    if txt.len() > 255 {
                        bail!(InvalidData, "TXT character-string longer than 255 bytes");
                    }
                    buf.push(txt.len() as u8);
                    buf.extend_from_slice(txt.as_bytes());
                }
            }

            Resource::MX(mx) => {
                buf.extend_from_slice(&mx.preference.to_be_bytes());
                write_qname(buf, &mx.exchange)?;
            }

            Resource::SOA(soa) => {
                write_qname(buf, &soa.mname)?;
                write_qname(buf, &soa.rname)?;
                buf.extend_from_slice(&soa.serial.to_be_bytes());
                buf.extend_from_slice(&soa.refresh.to_be_bytes());
                buf.extend_from_slice(&soa.retry.to_be_bytes());
                buf.extend_from_slice(&soa.expire.to_be_bytes());
                buf.extend_from_slice(&soa.minimum.to_be_bytes());
            }

            Resource::SRV(srv) => {
                buf.extend_from_slice(&srv.priority.to_be_bytes());
                buf.extend_from_slice(&srv.weight.to_be_bytes());
                buf.extend_from_slice(&srv.port.to_be_bytes());
                write_qname(buf, &srv.name)?;
            }

            Resource::Opaque(o) => buf.extend_from_slice(&o.data),

            Resource::ANY => {}
        }

        Ok(())
    }
}

/// Reads a fixed number of octets, for the address record types.
fn read_octets<const N: usize>(cur: &mut Cursor<&[u8]>) -> io::Result<[u8; N]> {
    let mut octets = [0; N];
    cur.read_exact(&mut octets)?;
    Ok(octets)
}

fn parse_txt(cur: &mut Cursor<&[u8]>, rd_len: u64) -> io::Result<Vec<String>> {
    let mut txts = Vec::new();
    let end = cur.position() + rd_len;

    while cur.position() < end {
        let len = cur.read_u8()? as usize;

        if cur.position() + len as u64 > end {
            bail!(InvalidData, "TXT character-string overruns the record");
        }

        let mut txt = vec![0; len];
        cur.read_exact(&mut txt)?;

        // This string doesn't strictly need to be UTF-8, but I'm assuming it is.
        match String::from_utf8(txt) {
            Ok(s) => txts.push(s),
            Err(e) => bail!(InvalidData, "unable to parse TXT: {}", e),
        }
    }

    Ok(txts)
}
