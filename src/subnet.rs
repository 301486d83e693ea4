//! The Client Subnet transform applied by the proxy: read, inject, or remove
//! the `EDNS0_SUBNET` option ([rfc7871]) on a [`Message`].
//!
//! The proxy only synthesizes an option when the client didn't supply one,
//! and only strips an option it synthesized. A client-supplied option passes
//! through unchanged in both directions.
//!
//! [rfc7871]: https://datatracker.ietf.org/doc/html/rfc7871

use crate::types::{ClientSubnet, EdnsOption, Extension, Message};
use std::net::IpAddr;

/// Returns the address of the first `EDNS0_SUBNET` option in the message, or
/// None when the message carries no such option (including when it has an
/// OPT record with other options).
pub fn get_subnet(msg: &Message) -> Option<IpAddr> {
    let ext = msg.extension.as_ref()?;

    ext.options.iter().find_map(|opt| match opt {
        EdnsOption::Subnet(subnet) => Some(subnet.address),
        EdnsOption::Unknown { .. } => None,
    })
}

/// Appends an `EDNS0_SUBNET` option derived from `client` to the message's
/// OPT record, creating the OPT record when there is none. Returns the
/// address that was inserted.
///
/// An IPv4-mapped IPv6 address is unwrapped and sent as family 1, so a
/// dual-stack listener doesn't advertise `::ffff:0:0/96` subnets. The whole
/// address is significant: `source_mask` 32 for IPv4, 128 for IPv6, scope 0.
///
/// Any option already present is left alone. In particular an existing
/// subnet option is not deduplicated; the new option lands alongside it.
pub fn set_subnet(msg: &mut Message, client: IpAddr) -> IpAddr {
    let address = match client {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => client,
        },
        IpAddr::V4(_) => client,
    };

    let ext = msg.extension.get_or_insert_with(Extension::default);
    ext.options
        .push(EdnsOption::Subnet(ClientSubnet::from_ip(address)));

    address
}

/// Removes the first `EDNS0_SUBNET` option from the message's OPT record,
/// leaving every other option intact. Returns whether an option was removed.
///
/// The encoder always writes the OPT record at the tail of the additional
/// section, so no re-ordering is needed here.
pub fn remove_subnet(msg: &mut Message) -> bool {
    let ext = match msg.extension.as_mut() {
        Some(ext) => ext,
        None => return false,
    };

    let at = ext
        .options
        .iter()
        .position(|opt| matches!(opt, EdnsOption::Subnet(_)));

    match at {
        Some(at) => {
            ext.options.remove(at);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Class, Type};
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn query() -> Message {
        let mut m = Message::default();
        m.add_question("example.com", Type::A, Class::Internet);
        m
    }

    #[test]
    fn test_set_subnet_creates_opt() {
        let mut m = query();
        assert_eq!(get_subnet(&m), None);

        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(set_subnet(&mut m, ip), ip);

        let ext = m.extension.as_ref().expect("no OPT record created");
        assert_eq!(
            ext.options,
            vec![EdnsOption::Subnet(ClientSubnet {
                address: ip,
                source_prefix: 32,
                scope_prefix: 0,
            })]
        );
        assert_eq!(get_subnet(&m), Some(ip));
    }

    #[test]
    fn test_set_subnet_ipv6() {
        let mut m = query();

        let ip: IpAddr = "2001:db8::7".parse().unwrap();
        set_subnet(&mut m, ip);

        assert_eq!(
            m.extension.unwrap().options,
            vec![EdnsOption::Subnet(ClientSubnet {
                address: ip,
                source_prefix: 128,
                scope_prefix: 0,
            })]
        );
    }

    #[test]
    fn test_set_subnet_unwraps_mapped_ipv4() {
        let mut m = query();

        let mapped = IpAddr::V6(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped());
        let inserted = set_subnet(&mut m, mapped);

        assert_eq!(inserted, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(
            m.extension.unwrap().options,
            vec![EdnsOption::Subnet(ClientSubnet {
                address: inserted,
                source_prefix: 32,
                scope_prefix: 0,
            })]
        );
    }

    #[test]
    fn test_set_subnet_keeps_existing_options() {
        let mut m = query();
        m.add_extension(Extension {
            options: vec![EdnsOption::Unknown {
                code: 10,
                data: vec![0xaa; 8],
            }],
            ..Default::default()
        });

        set_subnet(&mut m, IpAddr::V6(Ipv6Addr::LOCALHOST));

        let options = &m.extension.as_ref().unwrap().options;
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].code(), 10);
        assert_eq!(options[1].code(), ClientSubnet::OPTION_CODE);
    }

    #[test]
    fn test_set_subnet_appends_alongside_existing_subnet() {
        // A client-supplied option is not deduplicated.
        let mut m = query();
        set_subnet(&mut m, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
        set_subnet(&mut m, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));

        assert_eq!(m.extension.as_ref().unwrap().options.len(), 2);
        // get returns the first.
        assert_eq!(get_subnet(&m), Some("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn test_remove_subnet() {
        let mut m = query();
        set_subnet(&mut m, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));

        assert!(remove_subnet(&mut m));
        assert_eq!(m.extension.as_ref().unwrap().options, vec![]);

        // Nothing left to remove; OPT itself stays.
        assert!(!remove_subnet(&mut m));
        assert!(m.extension.is_some());
    }

    #[test]
    fn test_remove_subnet_first_of_several() {
        let mut m = query();
        m.add_extension(Extension {
            options: vec![
                EdnsOption::Unknown {
                    code: 10,
                    data: vec![1, 2, 3],
                },
                EdnsOption::Subnet(ClientSubnet::from_ip("198.51.100.1".parse().unwrap())),
                EdnsOption::Subnet(ClientSubnet::from_ip("203.0.113.7".parse().unwrap())),
            ],
            ..Default::default()
        });

        assert!(remove_subnet(&mut m));

        let options = &m.extension.as_ref().unwrap().options;
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].code(), 10);
        assert_eq!(get_subnet(&m), Some("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn test_remove_subnet_without_opt() {
        let mut m = query();
        assert!(!remove_subnet(&mut m));
    }
}
