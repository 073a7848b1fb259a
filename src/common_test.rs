#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use crate::common::{bencode_failure, bencode_int, bencode_bytes, ipv4_is_public_strict, ipv6_is_public_strict, parse_query, quote_bin, quote_str};

    #[test]
    fn test_parse_query() {
        let result = parse_query(Some(String::from("test1=test2&test1=test3&test7=test8&test5&test6"))).unwrap();
        assert_eq!(result.get("test1").unwrap(), &vec![b"test2".to_vec(), b"test3".to_vec()]);
        assert_eq!(result.get("test7").unwrap(), &vec![b"test8".to_vec()]);
        assert_eq!(result.get("test5").unwrap(), &vec![Vec::<u8>::new()]);
        assert_eq!(result.get("test6").unwrap(), &vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_parse_query_percent_decoding() {
        let result = parse_query(Some(String::from("info_hash=%00%01%ff%20abc"))).unwrap();
        assert_eq!(result.get("info_hash").unwrap()[0], vec![0x00u8, 0x01, 0xff, 0x20, b'a', b'b', b'c']);
    }

    #[test]
    fn test_hex_round_trip() {
        let data: Vec<u8> = (0u8..20).map(|i| i.wrapping_mul(13)).collect();
        assert_eq!(hex::decode(hex::encode(&data)).unwrap(), data);
    }

    #[test]
    fn test_bencode_failure_layout() {
        let body = bencode_failure("Unregistered torrent");
        assert_eq!(
            body,
            b"d14:failure reason20:Unregistered torrent12:min intervali5400e8:intervali5400ee".to_vec()
        );
    }

    #[test]
    fn test_bencode_helpers() {
        assert_eq!(bencode_int(-17), "i-17e");
        assert_eq!(bencode_bytes(b"spam"), b"4:spam".to_vec());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_str("it's"), "'it\\'s'");
        assert_eq!(quote_bin(&[0x00, 0xab, 0xff]), "X'00abff'");
        assert_eq!(quote_bin(&[]), "''");
    }

    #[test]
    fn test_ipv4_filter() {
        assert!(ipv4_is_public_strict(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(172, 31, 255, 1)));
        assert!(ipv4_is_public_strict(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(169, 254, 0, 1)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(!ipv4_is_public_strict(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn test_ipv6_filter() {
        assert!(ipv6_is_public_strict("2600:3c01::f03c".parse::<Ipv6Addr>().unwrap()));
        assert!(!ipv6_is_public_strict(Ipv6Addr::LOCALHOST));
        assert!(!ipv6_is_public_strict("fe80::1".parse::<Ipv6Addr>().unwrap()));
        assert!(!ipv6_is_public_strict("fc00::1".parse::<Ipv6Addr>().unwrap()));
        assert!(!ipv6_is_public_strict("2001:db8::1".parse::<Ipv6Addr>().unwrap()));
        assert!(!ipv6_is_public_strict("2002::1".parse::<Ipv6Addr>().unwrap()));
    }
}
