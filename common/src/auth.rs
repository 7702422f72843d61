use crate::config::Credentials;

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parses an `Authorization: Basic <base64(user:pass)>` header value.
pub fn parse_basic_authorization(header: &str) -> Option<BasicCredentials> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64_decode(encoded.trim())?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// True when the header carries the current web username/password pair.
/// No rate limiting; every attempt is evaluated on its own.
pub fn is_authorized(authorization: Option<&str>, credentials: &Credentials) -> bool {
    let Some(supplied) = authorization.and_then(parse_basic_authorization) else {
        return false;
    };

    constant_time_eq(supplied.username.as_bytes(), credentials.web_username.as_bytes())
        & constant_time_eq(supplied.password.as_bytes(), credentials.web_password.as_bytes())
}

pub(crate) fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn base64_value(symbol: u8) -> Option<u8> {
    BASE64_ALPHABET
        .iter()
        .position(|&candidate| candidate == symbol)
        .map(|index| index as u8)
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let bytes = input.trim_end_matches('=').as_bytes();
    if bytes.len() % 4 == 1 {
        return None;
    }

    let mut out = Vec::with_capacity(bytes.len() * 3 / 4);
    for chunk in bytes.chunks(4) {
        let mut acc = 0_u32;
        for (index, &symbol) in chunk.iter().enumerate() {
            acc |= u32::from(base64_value(symbol)?) << (18 - 6 * index);
        }

        out.push((acc >> 16) as u8);
        if chunk.len() > 2 {
            out.push((acc >> 8) as u8);
        }
        if chunk.len() > 3 {
            out.push(acc as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
pub(crate) fn basic_header(username: &str, password: &str) -> String {
    let raw = format!("{username}:{password}");
    let mut encoded = String::new();
    for chunk in raw.as_bytes().chunks(3) {
        let b0 = chunk[0] as usize;
        let b1 = chunk.get(1).copied().unwrap_or(0) as usize;
        let b2 = chunk.get(2).copied().unwrap_or(0) as usize;
        encoded.push(BASE64_ALPHABET[b0 >> 2] as char);
        encoded.push(BASE64_ALPHABET[((b0 & 0x03) << 4) | (b1 >> 4)] as char);
        encoded.push(if chunk.len() > 1 {
            BASE64_ALPHABET[((b1 & 0x0f) << 2) | (b2 >> 6)] as char
        } else {
            '='
        });
        encoded.push(if chunk.len() > 2 {
            BASE64_ALPHABET[b2 & 0x3f] as char
        } else {
            '='
        });
    }
    format!("Basic {encoded}")
}
