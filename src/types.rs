use crate::resource::*;
use std::net::IpAddr;
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// DNS Message that serves as the root of all queries and responses the
/// proxy handles.
///
/// # Examples
///
/// For constructing a query and encoding:
///
/// ```rust
/// use detdns::types::*;
///
/// let mut m = Message::default();
/// m.add_question("example.com", Type::A, Class::Internet);
///
/// // Encode the query as a Vec<u8> ready to be sent over UDP.
/// let req = m.to_vec().expect("failed to encode DNS request");
///
/// // And decode it back.
/// let m = Message::from_slice(&req).expect("invalid message");
/// assert_eq!(m.questions[0].name, "example.com.");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// 16-bit identifier assigned by the program that generates any kind of
    /// query. This identifier is copied into the corresponding reply and can be
    /// used by the requester to match up replies to outstanding queries.
    pub id: u16,

    /// Recursion Desired - this bit directs the name server to pursue the query
    /// recursively.
    pub rd: bool,

    /// Truncation - specifies that this message was truncated.
    pub tc: bool,

    /// Authoritative Answer - Specifies that the responding name server is an
    /// authority for the domain name in question section.
    pub aa: bool,

    /// Specifies kind of query in this message. 0 represents a standard query.
    /// See <https://www.iana.org/assignments/dns-parameters/dns-parameters.xhtml#dns-parameters-5>
    pub opcode: Opcode,

    /// Specifies whether this message is a query (0), or a response (1).
    pub qr: QR,

    /// Response code.
    pub rcode: Rcode,

    /// Checking Disabled. See [RFC4035] and [RFC6840].
    ///
    /// [rfc4035]: https://datatracker.ietf.org/doc/html/rfc4035
    /// [rfc6840]: https://datatracker.ietf.org/doc/html/rfc6840
    pub cd: bool,

    /// Authentic Data. See [RFC4035] and [RFC6840].
    ///
    /// [rfc4035]: https://datatracker.ietf.org/doc/html/rfc4035
    /// [rfc6840]: https://datatracker.ietf.org/doc/html/rfc6840
    pub ad: bool,

    /// Z Reserved for future use. You must set this field to 0.
    pub z: bool,

    /// Recursion Available - this be is set or cleared in a response, and
    /// denotes whether recursive query support is available in the name server.
    pub ra: bool,

    /// The questions.
    pub questions: Vec<Question>,

    /// The answer records.
    pub answers: Vec<Record>,

    /// The authoritive records.
    pub authoritys: Vec<Record>,

    /// The additional records, excluding the OPT pseudo-record.
    pub additionals: Vec<Record>,

    /// Optional EDNS(0) record. Hoisted out of the additional section, and
    /// always written back at its tail (per RFC 6891 §6.1.1 the OPT record
    /// is conventionally last).
    pub extension: Option<Extension>,
}

/// Question struct containing a domain name, question [`Type`] and question [`Class`].
#[derive(Clone, Debug, PartialEq)]
pub struct Question {
    /// The domain name in question, in dotted ASCII form.
    pub name: String,

    /// The question's type.
    ///
    /// All Type's are valid, including the pseudo types (e.g [`Type::ANY`]).
    pub r#type: Type,

    /// The question's class.
    pub class: Class,
}

/// Resource Record (RR) returned by DNS servers containing a answer to the question.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// A domain name in dotted ASCII form.
    pub name: String,

    /// The resource's class.
    pub class: Class,

    /// The number of seconds that the resource record may be cached
    /// before the source of the information should again be consulted.
    /// Zero is interpreted to mean that the RR can only be used for the
    /// transaction in progress.
    pub ttl: Duration,

    /// The actual resource.
    pub resource: Resource,
}

impl Record {
    pub fn r#type(&self) -> Type {
        self.resource.r#type()
    }
}

/// EDNS(0) extension record as defined in [rfc2671] and [rfc6891], carrying
/// its variable option list ([rfc6891] §6.1.2).
///
/// [rfc2671]: https://datatracker.ietf.org/doc/html/rfc2671
/// [rfc6891]: https://datatracker.ietf.org/doc/html/rfc6891
#[derive(Clone, Debug, PartialEq)]
pub struct Extension {
    /// Requestor's UDP payload size.
    pub payload_size: u16,

    /// Extended RCode.
    pub extend_rcode: u8,

    /// Version of the extension.
    pub version: u8,

    /// DNSSEC OK bit as defined by [rfc3225].
    ///
    /// [rfc3225]: https://datatracker.ietf.org/doc/html/rfc3225
    pub dnssec_ok: bool,

    /// The OPT record's options, in wire order.
    pub options: Vec<EdnsOption>,
}

impl Default for Extension {
    fn default() -> Self {
        Extension {
            payload_size: 4096,
            extend_rcode: 0,
            version: 0,
            dnssec_ok: false,
            options: Vec::default(),
        }
    }
}

/// A single option inside the OPT pseudo-record.
///
/// Only the Client Subnet option ([rfc7871]) is decoded; every other option
/// round-trips byte-identically through [`EdnsOption::Unknown`].
///
/// [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871
#[derive(Clone, Debug, PartialEq)]
pub enum EdnsOption {
    /// EDNS0 Client Subnet (option code 8).
    Subnet(ClientSubnet),

    /// Any option this library doesn't decode, kept verbatim.
    Unknown { code: u16, data: Vec<u8> },
}

impl EdnsOption {
    /// The option's wire code.
    pub fn code(&self) -> u16 {
        match self {
            EdnsOption::Subnet(_) => ClientSubnet::OPTION_CODE,
            EdnsOption::Unknown { code, .. } => *code,
        }
    }
}

/// EDNS0 Client Subnet option data ([rfc7871] §6).
///
/// [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSubnet {
    /// The client address the subnet is derived from. The address family
    /// on the wire (1 for IPv4, 2 for IPv6) follows from this value.
    pub address: IpAddr,

    /// Leftmost number of significant bits of `address`.
    pub source_prefix: u8,

    /// In a response, the prefix length the answer covers. Zero in queries.
    pub scope_prefix: u8,
}

impl ClientSubnet {
    /// Option code assigned to Client Subnet by IANA.
    pub const OPTION_CODE: u16 = 8;

    /// Builds the option for a full client address: the entire address is
    /// significant (/32 or /128) and the scope is zero, as for a query.
    pub fn from_ip(address: IpAddr) -> ClientSubnet {
        let source_prefix = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        ClientSubnet {
            address,
            source_prefix,
            scope_prefix: 0,
        }
    }

    /// The wire address family (1 for IPv4, 2 for IPv6).
    pub fn family(&self) -> u16 {
        match self.address {
            IpAddr::V4(_) => 1,
            IpAddr::V6(_) => 2,
        }
    }
}

/// Query or Response bit.
#[derive(Copy, Clone, Debug, EnumString, PartialEq)]
pub enum QR {
    Query = 0,
    Response = 1,
}

/// Defaults to [`QR::Query`].
impl Default for QR {
    fn default() -> Self {
        QR::Query
    }
}

impl QR {
    pub fn from_bool(b: bool) -> QR {
        match b {
            false => QR::Query,
            true => QR::Response,
        }
    }

    pub fn to_bool(self) -> bool {
        match self {
            QR::Query => false,
            QR::Response => true,
        }
    }
}

/// Specifies kind of query in this message. See [rfc1035], [rfc6895] and [DNS Parameters].
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
/// [rfc6895]: https://datatracker.ietf.org/doc/html/rfc6895
/// [DNS Parameters]: https://www.iana.org/assignments/dns-parameters/dns-parameters.xhtml#dns-parameters-5
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u8)] // Really only 4 bits
pub enum Opcode {
    /// Query.
    Query = 0,

    /// Inverse Query (OBSOLETE). See [rfc3425].
    ///
    /// [rfc3425]: https://datatracker.ietf.org/doc/html/rfc3425
    IQuery = 1,
    Status = 2,

    /// See [rfc1996]
    ///
    /// [rfc1996]: https://datatracker.ietf.org/doc/html/rfc1996
    Notify = 4,

    /// See [rfc2136]
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    Update = 5,

    /// DNS Stateful Operations (DSO). See [rfc8490]
    ///
    /// [rfc8490]: https://datatracker.ietf.org/doc/html/rfc8490
    DSO = 6,
    // 3 and 7-15 Remain unassigned.
}

/// Defaults to [`Opcode::Query`].
impl Default for Opcode {
    fn default() -> Self {
        Opcode::Query
    }
}

/// Response Codes.
/// See [rfc1035] and [DNS Parameters].
///
/// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
/// [DNS Parameters]: https://www.iana.org/assignments/dns-parameters/dns-parameters.xhtml#dns-parameters-6
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u16)] // In headers it is 4 bits, in extended OPTS it is 16.
pub enum Rcode {
    /// No Error
    NoError = 0,

    /// Format Error
    FormErr = 1,

    /// Server Failure. Returned by the proxy itself whenever it cannot
    /// produce an answer.
    ServFail = 2,

    /// Non-Existent Domain
    NXDomain = 3,

    /// Not Implemented
    NotImp = 4,

    /// Query Refused
    Refused = 5,

    /// Name Exists when it should not. See [rfc2136] and [rfc6672].
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    /// [rfc6672]: https://datatracker.ietf.org/doc/html/rfc6672
    YXDomain = 6,

    /// RR Set Exists when it should not. See [rfc2136].
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    YXRRSet = 7,

    /// RR Set that should exist does not. See [rfc2136].
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    NXRRSet = 8,

    /// "Not Authoritative" [rfc2136] or "Not Authorized" [rfc2845],
    /// depending on the presence of a TSIG record.
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    /// [rfc2845]: https://datatracker.ietf.org/doc/html/rfc2845
    NotAuth = 9,

    /// Name not contained in zone. See [rfc2136].
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    NotZone = 10,

    /// DSO-TYPE Not Implemented. See [rfc8490].
    ///
    /// [rfc8490]: https://datatracker.ietf.org/doc/html/rfc8490
    DSOTYPENI = 11,
    // 12-15 Unassigned
}

/// Defaults to [`Rcode::NoError`].
impl Default for Rcode {
    fn default() -> Self {
        Rcode::NoError
    }
}

/// Resource Record Type, for example, A, CNAME or SOA.
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq)]
#[allow(clippy::upper_case_acronyms)]
#[repr(u16)]
pub enum Type {
    Reserved = 0,

    /// (Default) IPv4 Address.
    A = 1,
    NS = 2,
    CNAME = 5,
    SOA = 6,

    /// Domain name pointer.
    PTR = 12,

    /// Mail exchange.
    MX = 15,

    /// Text strings.
    TXT = 16,

    /// IPv6 Address.
    AAAA = 28,

    /// Server Selection
    SRV = 33,

    /// EDNS(0) Opt type. See [rfc3225] and [rfc6891].
    ///
    /// [rfc3225]: https://datatracker.ietf.org/doc/html/rfc3225
    /// [rfc6891]: https://datatracker.ietf.org/doc/html/rfc6891
    OPT = 41,

    /// Delegation Signer. See [rfc4034].
    ///
    /// [rfc4034]: https://datatracker.ietf.org/doc/html/rfc4034
    DS = 43,

    /// DNSSEC signature. See [rfc4034].
    ///
    /// [rfc4034]: https://datatracker.ietf.org/doc/html/rfc4034
    RRSIG = 46,

    /// Next Secure record. See [rfc4034].
    ///
    /// [rfc4034]: https://datatracker.ietf.org/doc/html/rfc4034
    NSEC = 47,

    /// DNSSEC key. See [rfc4034].
    ///
    /// [rfc4034]: https://datatracker.ietf.org/doc/html/rfc4034
    DNSKEY = 48,

    /// Service Binding. See [rfc9460].
    ///
    /// [rfc9460]: https://datatracker.ietf.org/doc/html/rfc9460
    SVCB = 64,

    /// HTTPS Binding. See [rfc9460].
    ///
    /// [rfc9460]: https://datatracker.ietf.org/doc/html/rfc9460
    HTTPS = 65,

    /// Any record type.
    /// Only valid as a Question Type.
    ANY = 255,

    /// Certification Authority Restriction. See [rfc8659].
    ///
    /// [rfc8659]: https://datatracker.ietf.org/doc/html/rfc8659
    CAA = 257,
}

/// Defaults to [`Type::ANY`].
impl Default for Type {
    fn default() -> Self {
        Type::ANY
    }
}

/// Resource Record Class, for example Internet.
#[derive(Copy, Clone, Debug, Display, EnumString, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum Class {
    /// Reserved per [RFC6895]
    ///
    /// [rfc6895]: https://datatracker.ietf.org/doc/html/rfc6895
    Reserved = 0,

    /// (Default) The Internet (IN), see [rfc1035].
    ///
    /// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
    #[strum(serialize = "IN")]
    Internet = 1,

    /// CSNET (CS), obsolete (used only for examples in some obsolete RFCs).
    #[strum(serialize = "CS")]
    CsNet = 2,

    /// Chaosnet (CH), obsolete LAN protocol created at MIT in the mid-1970s.
    #[strum(serialize = "CH")]
    Chaos = 3,

    /// Hesiod (HS), an information service developed by MIT's Project Athena.
    #[strum(serialize = "HS")]
    Hesiod = 4,

    /// No class specified, see [rfc2136]
    ///
    /// [rfc2136]: https://datatracker.ietf.org/doc/html/rfc2136
    None = 254,

    /// * (ANY) See [rfc1035]
    ///
    /// [rfc1035]: https://datatracker.ietf.org/doc/html/rfc1035
    #[strum(serialize = "*")]
    Any = 255,
    //     5-253     Unassigned
    //   256-65279   Unassigned
    // 65280-65534   Reserved for Private Use    [RFC6895]
    // 65535         Reserved    [RFC6895]
}

/// Defaults to [`Class::Internet`].
impl Default for Class {
    fn default() -> Self {
        Class::Internet
    }
}

/// Recource Record Definitions.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    A(A),
    AAAA(AAAA),

    CNAME(CNAME),
    NS(NS),
    PTR(PTR),

    TXT(TXT),

    MX(MX),
    SOA(SOA),
    SRV(SRV),

    /// A type without a structured decode, carried verbatim. Only types
    /// whose RDATA cannot contain compression pointers are kept this way,
    /// so re-encoding the bytes unchanged is always valid.
    Opaque(Opaque),

    ANY, // Not a valid Record Type, but is a Type
}

impl Resource {
    pub fn r#type(&self) -> Type {
        // This should be kept in sync with Type.
        match self {
            Resource::A(_) => Type::A,
            Resource::AAAA(_) => Type::AAAA,
            Resource::CNAME(_) => Type::CNAME,
            Resource::NS(_) => Type::NS,
            Resource::PTR(_) => Type::PTR,
            Resource::TXT(_) => Type::TXT,
            Resource::MX(_) => Type::MX,
            Resource::SOA(_) => Type::SOA,
            Resource::SRV(_) => Type::SRV,
            Resource::Opaque(o) => o.r#type,
            Resource::ANY => Type::ANY,
        }
    }
}
