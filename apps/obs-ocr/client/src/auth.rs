use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

/// Answer to the `Hello` authentication challenge:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
pub fn authentication_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_protocol_reference_vector() {
        let auth = authentication_string(
            "supersecretpassword",
            "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=",
            "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=",
        );
        assert_eq!(auth, "1Ct943GAT+6YQUUX47Ia/ncufilbe6+oD6lY+5kaCu4=");
    }

    #[test]
    fn challenge_changes_the_answer() {
        assert_ne!(
            authentication_string("pw", "salt", "one"),
            authentication_string("pw", "salt", "two")
        );
    }
}
