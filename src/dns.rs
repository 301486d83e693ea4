use crate::bail;
use crate::io::{DNSReadExt, SeekExt};
use crate::types::Record;
use crate::types::*;
use byteorder::{ReadBytesExt, BE};
use num_traits::FromPrimitive;
use rand::Rng;
use std::io;
use std::io::Cursor;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Copy, Clone, PartialEq)]
enum RecordSection {
    Answers,
    Authorities,
    Additionals,
}

/// A helper class to hold state while the parsing is happening.
pub(crate) struct MessageParser<'a> {
    cur: Cursor<&'a [u8]>,

    m: Message,
}

impl<'a> MessageParser<'a> {
    fn new(buf: &[u8]) -> MessageParser {
        MessageParser {
            cur: Cursor::new(buf),
            m: Message::default(),
        }
    }

    /// Consume the [`MessageParser`] and returned the resulting Message.
    fn parse(mut self) -> io::Result<Message> {
        self.m.id = self.cur.read_u16::<BE>()?;

        let b = self.cur.read_u8()?;
        self.m.qr = QR::from_bool(0b1000_0000 & b != 0);
        let opcode = (0b0111_1000 & b) >> 3;
        self.m.aa = (0b0000_0100 & b) != 0;
        self.m.tc = (0b0000_0010 & b) != 0;
        self.m.rd = (0b0000_0001 & b) != 0;

        self.m.opcode = match FromPrimitive::from_u8(opcode) {
            Some(t) => t,
            None => bail!(InvalidData, "invalid Opcode({})", opcode),
        };

        let b = self.cur.read_u8()?;
        self.m.ra = (0b1000_0000 & b) != 0;
        self.m.z = (0b0100_0000 & b) != 0; // Unused
        self.m.ad = (0b0010_0000 & b) != 0;
        self.m.cd = (0b0001_0000 & b) != 0;
        let rcode = 0b0000_1111 & b;

        self.m.rcode = match FromPrimitive::from_u8(rcode) {
            Some(t) => t,
            None => bail!(InvalidData, "invalid RCode({})", rcode),
        };

        let qd_count = self.cur.read_u16::<BE>()?;
        let an_count = self.cur.read_u16::<BE>()?;
        let ns_count = self.cur.read_u16::<BE>()?;
        let ar_count = self.cur.read_u16::<BE>()?;

        self.read_questions(qd_count)?;
        self.read_records(an_count, RecordSection::Answers)?;
        self.read_records(ns_count, RecordSection::Authorities)?;
        self.read_records(ar_count, RecordSection::Additionals)?;

        if self.cur.remaining()? > 0 {
            bail!(
                Other,
                "finished parsing with {} bytes left over",
                self.cur.remaining()?
            );
        }

        Ok(self.m)
    }

    fn read_questions(&mut self, count: u16) -> io::Result<()> {
        self.m.questions.reserve_exact(count.into());

        for _ in 0..count {
            let name = self.cur.read_qname()?;
            let r#type = self.cur.read_type()?;
            let class = self.cur.read_class()?;

            self.m.questions.push(Question {
                name,
                r#type,
                class,
            });
        }

        Ok(())
    }

    fn read_records(&mut self, count: u16, section: RecordSection) -> io::Result<()> {
        for _ in 0..count {
            let name = self.cur.read_qname()?;
            let r#type = self.cur.read_type()?;

            if section == RecordSection::Additionals && r#type == Type::OPT {
                if self.m.extension.is_some() {
                    bail!(
                        InvalidData,
                        "multiple EDNS(0) extensions. Expected only one."
                    );
                }

                let ext = Extension::parse(&mut self.cur, name, r#type)?;

                self.m.extension = Some(ext);
            } else {
                let class = self.cur.read_class()?;
                let record = Record::parse(&mut self.cur, name, r#type, class)?;

                let records = match section {
                    RecordSection::Answers => &mut self.m.answers,
                    RecordSection::Authorities => &mut self.m.authoritys,
                    RecordSection::Additionals => &mut self.m.additionals,
                };
                records.push(record);
            }
        }

        Ok(())
    }
}

/// Defaults to a [`Message`] with sensibles values for querying.
impl Default for Message {
    fn default() -> Self {
        Message {
            id: Message::random_id(),
            rd: true,
            tc: false,
            aa: false,
            opcode: Opcode::Query,
            qr: QR::Query,
            rcode: Rcode::NoError,
            cd: false,
            ad: true,
            z: false,
            ra: false,

            questions: Vec::default(),
            answers: Vec::default(),
            authoritys: Vec::default(),
            additionals: Vec::default(),
            extension: None,
        }
    }
}

impl Message {
    /// Returns a random u16 suitable for the [`Message`] id field.
    pub fn random_id() -> u16 {
        rand::thread_rng().gen()
    }

    /// Decodes the supplied buffer and returns a [`Message`].
    pub fn from_slice(buf: &[u8]) -> io::Result<Message> {
        MessageParser::new(buf).parse()
    }

    /// Adds a question to the message. The domain is stored in its dotted
    /// form, with the trailing dot appended if missing.
    pub fn add_question(&mut self, domain: &str, r#type: Type, class: Class) {
        let mut name = domain.to_string();
        if !name.ends_with('.') {
            name.push('.');
        }

        self.questions.push(Question {
            name,
            r#type,
            class,
        });
    }

    /// Adds a EDNS(0) extension record, as defined by [rfc6891](https://datatracker.ietf.org/doc/html/rfc6891).
    pub fn add_extension(&mut self, ext: Extension) {
        self.extension = Some(ext);
    }

    /// Encodes this DNS [`Message`] as a [`Vec<u8>`] ready to be sent, as defined by [rfc1035].
    ///
    /// Names are written uncompressed, which is always valid (if sometimes
    /// larger than the message the records came from). The OPT pseudo-record,
    /// when present, is written at the tail of the additional section.
    ///
    /// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        let mut req = Vec::<u8>::with_capacity(512);

        req.extend_from_slice(&self.id.to_be_bytes());

        let mut b = 0_u8;
        b |= if self.qr.to_bool() { 0b1000_0000 } else { 0 };
        b |= ((self.opcode as u8) << 3) & 0b0111_1000;
        b |= if self.aa { 0b0000_0100 } else { 0 };
        b |= if self.tc { 0b0000_0010 } else { 0 };
        b |= if self.rd { 0b0000_0001 } else { 0 };
        req.push(b);

        let mut b = 0_u8;
        b |= if self.ra { 0b1000_0000 } else { 0 };
        b |= if self.z { 0b0100_0000 } else { 0 };
        b |= if self.ad { 0b0010_0000 } else { 0 };
        b |= if self.cd { 0b0001_0000 } else { 0 };
        b |= (self.rcode as u8) & 0b0000_1111;

        req.push(b);

        let ar_count = self.additionals.len() as u16 + self.extension.is_some() as u16;

        req.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        req.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        req.extend_from_slice(&(self.authoritys.len() as u16).to_be_bytes());
        req.extend_from_slice(&ar_count.to_be_bytes());

        for question in &self.questions {
            write_qname(&mut req, &question.name)?;

            req.extend_from_slice(&(question.r#type as u16).to_be_bytes());
            req.extend_from_slice(&(question.class as u16).to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(self.authoritys.iter())
            .chain(self.additionals.iter())
        {
            record.write(&mut req)?;
        }

        if let Some(e) = &self.extension {
            e.write(&mut req)?
        }

        Ok(req)
    }
}

/// Writes a domain name into the supplied [`Vec<u8>`].
///
/// ASCII domains are written as-is, preserving label case. A unicode domain
/// is puny encoded first.
pub(crate) fn write_qname(buf: &mut Vec<u8>, domain: &str) -> io::Result<()> {
    let encoded;
    let domain = if domain.is_ascii() {
        domain
    } else {
        encoded = match idna::domain_to_ascii(domain) {
            Err(e) => {
                bail!(InvalidData, "invalid dns name '{0}': {1:?}", domain, e);
            }
            Ok(domain) => domain,
        };
        &encoded
    };

    if !domain.is_empty() && domain != "." {
        for label in domain.split_terminator('.') {
            if label.is_empty() {
                bail!(InvalidData, "empty label in domain name '{}'", domain);
            }

            if label.len() > 63 {
                bail!(InvalidData, "label '{0}' longer than 63 characters", label);
            }

            // Write the length.
            buf.push(label.len() as u8);

            // Then the actual label.
            buf.extend_from_slice(label.as_bytes());
        }
    }

    buf.push(0);

    Ok(())
}

impl Extension {
    /// Parses the OPT pseudo-record, including its option list. The name and
    /// type have already been consumed by the caller.
    pub(crate) fn parse(
        cur: &mut Cursor<&[u8]>,
        domain: String,
        r#type: Type,
    ) -> io::Result<Extension> {
        assert!(r#type == Type::OPT);

        if domain != "." {
            bail!(
                InvalidData,
                "expected root domain for EDNS(0) extension, got '{}'",
                domain
            );
        }

        let payload_size = cur.read_u16::<BE>()?;
        let extend_rcode = cur.read_u8()?;

        let version = cur.read_u8()?;
        let b = cur.read_u8()?;
        let dnssec_ok = b & 0b1000_0000 == 0b1000_0000;

        let _z = cur.read_u8()?;

        let rd_len = cur.read_u16::<BE>()? as u64;
        let end = cur.position() + rd_len;

        let mut options = Vec::new();
        while cur.position() < end {
            let code = cur.read_u16::<BE>()?;
            let len = cur.read_u16::<BE>()? as u64;

            if cur.position() + len > end {
                bail!(InvalidData, "OPT option({}) overruns the record", code);
            }

            let mut data = vec![0; len as usize];
            cur.read_exact(&mut data)?;

            options.push(EdnsOption::parse(code, data));
        }

        Ok(Extension {
            payload_size,
            extend_rcode,
            version,
            dnssec_ok,
            options,
        })
    }

    /// Encodes the OPT pseudo-record, including its option list.
    pub(crate) fn write(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.push(0); // A single "." domain name
        buf.extend_from_slice(&(Type::OPT as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload_size.to_be_bytes());

        buf.push(self.extend_rcode);
        buf.push(self.version);

        let mut b = 0_u8;
        b |= if self.dnssec_ok { 0b1000_0000 } else { 0 };

        // 16 bits of flags.
        buf.push(b);
        buf.push(0);

        // RDLENGTH is backpatched once the options have been written.
        let len_at = buf.len();
        buf.extend_from_slice(&[0, 0]);

        for option in &self.options {
            option.write(buf);
        }

        let rd_len = buf.len() - len_at - 2;
        if rd_len > u16::MAX as usize {
            bail!(InvalidData, "OPT options longer than 65535 bytes");
        }
        buf[len_at..len_at + 2].copy_from_slice(&(rd_len as u16).to_be_bytes());

        Ok(())
    }
}

impl EdnsOption {
    /// Decodes a single option. Anything that isn't a well-formed Client
    /// Subnet option is carried verbatim, so it round-trips untouched.
    fn parse(code: u16, data: Vec<u8>) -> EdnsOption {
        if code == ClientSubnet::OPTION_CODE {
            if let Some(subnet) = ClientSubnet::from_wire(&data) {
                return EdnsOption::Subnet(subnet);
            }
        }

        EdnsOption::Unknown { code, data }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            EdnsOption::Subnet(subnet) => {
                let data = subnet.to_wire();

                buf.extend_from_slice(&ClientSubnet::OPTION_CODE.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(&data);
            }

            EdnsOption::Unknown { code, data } => {
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(data);
            }
        }
    }
}

impl ClientSubnet {
    /// Decodes option data per [rfc7871] §6. Returns None when the family is
    /// unknown or the address bytes disagree with the family, in which case
    /// the caller keeps the raw option instead.
    ///
    /// [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871
    fn from_wire(data: &[u8]) -> Option<ClientSubnet> {
        if data.len() < 4 {
            return None;
        }

        let family = u16::from_be_bytes([data[0], data[1]]);
        let source_prefix = data[2];
        let scope_prefix = data[3];
        let addr = &data[4..];

        // The address is truncated to the bytes the source prefix covers,
        // zero extend it back to its full width.
        let address = match family {
            1 => {
                if addr.len() > 4 || source_prefix > 32 {
                    return None;
                }
                let mut octets = [0_u8; 4];
                octets[..addr.len()].copy_from_slice(addr);
                IpAddr::V4(Ipv4Addr::from(octets))
            }

            2 => {
                if addr.len() > 16 || source_prefix > 128 {
                    return None;
                }
                let mut octets = [0_u8; 16];
                octets[..addr.len()].copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            }

            _ => return None,
        };

        Some(ClientSubnet {
            address,
            source_prefix,
            scope_prefix,
        })
    }

    /// Encodes the option data: family, prefixes, then only as many address
    /// octets as the source prefix covers ([rfc7871] §6).
    ///
    /// [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871
    fn to_wire(&self) -> Vec<u8> {
        let addr_len = (self.source_prefix as usize + 7) / 8;

        let mut data = Vec::with_capacity(4 + addr_len);
        data.extend_from_slice(&self.family().to_be_bytes());
        data.push(self.source_prefix);
        data.push(self.scope_prefix);

        match self.address {
            IpAddr::V4(ip) => data.extend_from_slice(&ip.octets()[..addr_len]),
            IpAddr::V6(ip) => data.extend_from_slice(&ip.octets()[..addr_len]),
        }

        data
    }
}
