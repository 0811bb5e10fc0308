//! Payload serialization seam.
//!
//! RPC payloads are opaque byte blobs on the wire; typed values cross the
//! boundary through facet-postcard here and nowhere else.

/// Serialize a payload value.
///
/// Panics with a readable message if serialization fails; payload types are
/// plain owned data and a failure here is a programming error, not a runtime
/// condition worth threading through every call site.
#[track_caller]
pub fn to_vec<T: facet::Facet<'static>>(value: &T) -> Vec<u8> {
    facet_postcard::to_vec(value)
        .unwrap_or_else(|e| panic!("failed to serialize rpc payload: {e}"))
}

/// Deserialize a payload value.
pub fn from_slice<T: facet::Facet<'static>>(
    bytes: &[u8],
) -> Result<T, facet_postcard::DeserializeError> {
    facet_postcard::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let bytes = to_vec(&String::from("topic"));
        let back: String = from_slice(&bytes).unwrap();
        assert_eq!(back, "topic");
    }

    #[test]
    fn string_list_roundtrip() {
        let list = vec![String::from("a"), String::from("b")];
        let bytes = to_vec(&list);
        let back: Vec<String> = from_slice(&bytes).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn unit_roundtrip() {
        let bytes = to_vec(&());
        from_slice::<()>(&bytes).unwrap();
    }
}
