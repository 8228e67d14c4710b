//! SIP address parsing
//!
//! A small RFC 3261 subset, enough to validate the identity a session
//! registers with:
//!
//! ```text
//! address  = scheme ":" user "@" host [ ":" port ]
//! scheme   = "sip" / "sips"                       ; case-insensitive
//! user     = 1*( unreserved / escaped / user-unreserved )
//! host     = hostname / IPv4address / "[" IPv6address "]"
//! hostname = label *( "." label )                 ; alphanum and "-"
//! ```
//!
//! URI parameters and headers are not accepted.
//!
//! ```rust
//! use sipline_session_controller::address::SipAddress;
//!
//! let address: SipAddress = "sip:alice@sip.example.com".parse().unwrap();
//! assert_eq!(address.username(), "alice");
//! assert_eq!(address.domain(), "sip.example.com");
//!
//! assert!("sip:@sip.example.com".parse::<SipAddress>().is_err());
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1, satisfy},
    combinator::{map, map_res, recognize, verify},
    multi::{many1, separated_list1},
    sequence::{delimited, preceded, terminated, tuple},
    IResult,
};
use thiserror::Error;

/// Error returned when an address fails to parse
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("'{input}' is not a valid SIP address: {reason}")]
pub struct AddressError {
    pub input: String,
    pub reason: &'static str,
}

/// URI scheme of a SIP address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host part of a SIP address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A domain name (e.g. "sip.example.com")
    Domain(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(domain) => f.write_str(domain),
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Ipv6(ip) => write!(f, "[{}]", ip),
        }
    }
}

/// A validated `sip:user@host[:port]` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipAddress {
    scheme: Scheme,
    user: String,
    host: Host,
    host_text: String,
    hostport: String,
    port: Option<u16>,
}

impl SipAddress {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// User part, as written
    pub fn username(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Host part exactly as it appeared in the parsed text
    pub fn domain(&self) -> &str {
        &self.host_text
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// `host[:port]` exactly as written after the `@`
    pub fn hostport(&self) -> &str {
        &self.hostport
    }
}

impl fmt::Display for SipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scheme, self.user, self.hostport())
    }
}

impl FromStr for SipAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| AddressError {
            input: s.to_string(),
            reason,
        };

        let (rest, scheme) = scheme(s).map_err(|_| fail("expected a sip: or sips: scheme"))?;
        let (rest, user) = user(rest).map_err(|_| fail("missing or malformed user part"))?;
        let (rest, _) = char::<_, nom::error::Error<&str>>('@')(rest)
            .map_err(|_| fail("expected '@' after the user part"))?;
        let hostport = rest;
        let (rest, (host, host_text)) = host(rest).map_err(|_| fail("missing or malformed host"))?;

        let (rest, port) = if rest.starts_with(':') {
            let (rest, port) = port(rest).map_err(|_| fail("port must be between 1 and 65535"))?;
            (rest, Some(port))
        } else {
            (rest, None)
        };

        if !rest.is_empty() {
            return Err(fail("unexpected characters after the host"));
        }

        Ok(SipAddress {
            scheme,
            user: user.to_string(),
            host,
            host_text: host_text.to_string(),
            hostport: hostport.to_string(),
            port,
        })
    }
}

fn scheme(input: &str) -> IResult<&str, Scheme> {
    terminated(
        alt((
            map(tag_no_case("sips"), |_| Scheme::Sips),
            map(tag_no_case("sip"), |_| Scheme::Sip),
        )),
        char(':'),
    )(input)
}

// unreserved = alphanum / mark
// mark = "-" / "_" / "." / "!" / "~" / "*" / "'" / "(" / ")"
// user-unreserved = "&" / "=" / "+" / "$" / "," / ";" / "?" / "/"
fn is_user_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '&' | '=' | '+' | '$' | ',' | ';' | '?' | '/'
        )
}

// escaped = "%" HEXDIG HEXDIG
fn escaped(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        char('%'),
        satisfy(|c| c.is_ascii_hexdigit()),
        satisfy(|c| c.is_ascii_hexdigit()),
    )))(input)
}

fn user(input: &str) -> IResult<&str, &str> {
    recognize(many1(alt((take_while1(is_user_char), escaped))))(input)
}

fn label(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        |label: &str| label.len() <= 63 && !label.starts_with('-') && !label.ends_with('-'),
    )(input)
}

fn hostname(input: &str) -> IResult<&str, &str> {
    verify(recognize(separated_list1(char('.'), label)), |name: &str| {
        name.len() <= 253
    })(input)
}

fn ipv6_reference(input: &str) -> IResult<&str, (Host, &str)> {
    let (rest, text) = recognize(delimited(
        char('['),
        take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
        char(']'),
    ))(input)?;
    let ip = text[1..text.len() - 1]
        .parse::<Ipv6Addr>()
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((rest, (Host::Ipv6(ip), text)))
}

fn named_host(input: &str) -> IResult<&str, (Host, &str)> {
    let (rest, text) = hostname(input)?;
    let all_numeric = text.split('.').all(|label| label.chars().all(|c| c.is_ascii_digit()));
    if all_numeric {
        // Dotted digits must be a real IPv4 address, not a hostname
        let ip = text
            .parse::<Ipv4Addr>()
            .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
        return Ok((rest, (Host::Ipv4(ip), text)));
    }
    Ok((rest, (Host::Domain(text.to_string()), text)))
}

fn host(input: &str) -> IResult<&str, (Host, &str)> {
    alt((ipv6_reference, named_host))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    preceded(
        char(':'),
        verify(map_res(digit1, |digits: &str| digits.parse::<u16>()), |port: &u16| *port != 0),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_address() {
        let address: SipAddress = "sip:alice@sip.example.com".parse().unwrap();
        assert_eq!(address.scheme(), Scheme::Sip);
        assert_eq!(address.username(), "alice");
        assert_eq!(address.domain(), "sip.example.com");
        assert_eq!(address.host(), &Host::Domain("sip.example.com".to_string()));
        assert_eq!(address.port(), None);
        assert_eq!(address.to_string(), "sip:alice@sip.example.com");
    }

    #[test]
    fn test_parse_with_port_and_secure_scheme() {
        let address: SipAddress = "SIPS:bob@example.org:5061".parse().unwrap();
        assert_eq!(address.scheme(), Scheme::Sips);
        assert_eq!(address.port(), Some(5061));
        assert_eq!(address.domain(), "example.org");
        assert_eq!(address.hostport(), "example.org:5061");
        assert_eq!(address.to_string(), "sips:bob@example.org:5061");
    }

    #[test]
    fn test_parse_ip_hosts() {
        let v4: SipAddress = "sip:0702552520@192.168.1.10".parse().unwrap();
        assert_eq!(v4.host(), &Host::Ipv4(Ipv4Addr::new(192, 168, 1, 10)));

        let v6: SipAddress = "sip:carol@[2001:db8::1]:5060".parse().unwrap();
        assert!(matches!(v6.host(), Host::Ipv6(_)));
        assert_eq!(v6.domain(), "[2001:db8::1]");
    }

    #[test]
    fn test_escaped_and_user_unreserved_characters() {
        let address: SipAddress = "sip:first.last%40corp+ext=1@example.com".parse().unwrap();
        assert_eq!(address.username(), "first.last%40corp+ext=1");
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        let cases = [
            ("sip:@sip.example.com", "missing or malformed user part"),
            ("alice@sip.example.com", "expected a sip: or sips: scheme"),
            ("tel:+15551234", "expected a sip: or sips: scheme"),
            ("sip:alice", "expected '@' after the user part"),
            ("sip:alice@", "missing or malformed host"),
            ("sip:alice@exa mple.com", "unexpected characters after the host"),
            ("sip:alice@bad_domain.com", "unexpected characters after the host"),
            ("sip:alice@-example.com", "missing or malformed host"),
            ("sip:alice@example..com", "unexpected characters after the host"),
            ("sip:alice@999.1.1.1", "missing or malformed host"),
            ("sip:alice@example.com:0", "port must be between 1 and 65535"),
            ("sip:alice@example.com:70000", "port must be between 1 and 65535"),
            ("sip:al%4@example.com", "expected '@' after the user part"),
            ("sip:alice@example.com;transport=tcp", "unexpected characters after the host"),
        ];

        for (input, reason) in cases {
            let err = input.parse::<SipAddress>().unwrap_err();
            assert_eq!(err.reason, reason, "input: {}", input);
            assert_eq!(err.input, input);
        }
    }
}
