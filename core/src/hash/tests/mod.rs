use super::*;

use crate::error::CoreError;

const BLOB: &[u8] = b"hello world";

#[test]
fn test_basic() {
    let hash = Hash::sha256_from_bytes(BLOB);

    let expected_base16 = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde";
    assert_eq!(expected_base16, hash.to_typed_base16());

    // base32 is just another encoding of the same digest; round-trip it.
    assert_eq!(
        Hash::from_typed(&hash.to_typed_base32()).unwrap(),
        Hash::from_typed(expected_base16).unwrap()
    );
}

#[test]
fn test_from_typed() {
    let base16 = "sha256:baeabdb75c223d171800c17b05c5e7e8e9980723a90eb6ffcc632a305afc5a42";
    let base32 = "sha256:0hjszid30ak3rkzvc3m94c3risg8wz2hayy100c1fg92bjvvvsms";

    assert_eq!(
        Hash::from_typed(base16).unwrap(),
        Hash::from_typed(base32).unwrap()
    );

    assert!(matches!(
        Hash::from_typed("sha256"),
        Err(CoreError::HashError(Error::NoColonSeparator))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:"),
        Err(CoreError::HashError(Error::InvalidHashStringLength { .. }))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"),
        Err(CoreError::HashError(Error::InvalidBase32Hash))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:gggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggg"),
        Err(CoreError::HashError(Error::InvalidBase16Hash(_)))
    ));

    assert!(matches!(
        Hash::from_typed("md5:invalid"),
        Err(CoreError::HashError(Error::UnsupportedHashAlgorithm(alg))) if alg == "md5"
    ));
}
