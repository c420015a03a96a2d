mod decoder;
mod encoder;
mod value;

pub use decoder::decode;
pub use encoder::encode;
pub use value::BencodeValue;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_decode_nested_dict() {
        let value = decode(b"d4:infod6:lengthi42e4:name3:fooe5:tiersll1:aeee").unwrap();

        let info = value.get("info").unwrap();
        assert_eq!(info.get_int("length"), Some(42));
        assert_eq!(info.get_str("name"), Some("foo"));

        let tiers = value.get_list("tiers").unwrap();
        assert_eq!(tiers[0].as_list().unwrap()[0].as_str(), Some("a"));
    }

    #[test]
    fn test_decode_binary_string() {
        let value = decode(b"3:\x00\xff\x10").unwrap();
        assert_eq!(value.as_bytes(), Some(&[0x00, 0xff, 0x10][..]));
        assert_eq!(value.as_str(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"di1e3:fooe").is_err());
        assert!(decode(b"le").is_ok());
        assert!(decode(b"lei1e").is_err());
        assert!(decode(b"x").is_err());
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let mut data = vec![b'l'; 100];
        data.extend(vec![b'e'; 100]);
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_encode_sorts_dict_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zeta".to_vec(), BencodeValue::Integer(-7));
        dict.insert(
            b"alpha".to_vec(),
            BencodeValue::List(vec![BencodeValue::String(b"x".to_vec())]),
        );

        let encoded = encode(&BencodeValue::Dict(dict));
        assert_eq!(encoded, b"d5:alphal1:xe4:zetai-7ee");
    }

    #[test]
    fn test_reencoding_preserves_bytes() {
        let raw = b"d6:lengthi1024e4:name8:file.bin12:piece lengthi512e6:pieces0:e";
        let value = decode(raw).unwrap();
        assert_eq!(encode(&value), raw.to_vec());
    }
}
