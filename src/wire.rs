//! Wire-format codecs used by DNS-SD.
//!
//! Three formats live here:
//! - DNS TXT record content: 8-bit length-prefixed `key=value` entries
//!   ([RFC 6763 section 6](https://www.rfc-editor.org/rfc/rfc6763#section-6)).
//! - Service instance full names with `\DDD` decimal escaping, as used by
//!   mDNS responders.
//! - DNS LOC record RDATA
//!   ([RFC 1876](https://www.rfc-editor.org/rfc/rfc1876)), built from a
//!   `geo:` URI ([RFC 5870](https://www.rfc-editor.org/rfc/rfc5870)).

use crate::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Max length of an escaped full name, including the trailing dot.
///
/// Matches the longest full name a native responder accepts
/// (255 bytes of wire-format name, fully escaped).
pub const FULL_NAME_MAX: usize = 1009;

/// Max encoded length of a single TXT entry (`key=value`), per RFC 6763.
pub const TXT_ENTRY_MAX: usize = 255;

/// Represents a property in a TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtProperty {
    /// The name of the property. The original cases are kept.
    key: String,

    /// RFC 6763 says values are bytes, not necessarily UTF-8.
    /// For now we define `val` as UTF-8 for ergonomics benefits.
    val: String,
}

impl TxtProperty {
    /// Creates a property from a key and a value.
    pub fn new(key: impl ToString, val: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            val: val.to_string(),
        }
    }

    /// Returns the key of a property.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the value of a property.
    pub fn val(&self) -> &str {
        &self.val
    }
}

/// Supports constructing from a tuple.
impl<K, V> From<&(K, V)> for TxtProperty
where
    K: ToString,
    V: ToString,
{
    fn from(prop: &(K, V)) -> Self {
        TxtProperty {
            key: prop.0.to_string(),
            val: prop.1.to_string(),
        }
    }
}

/// Represents properties in a TXT record.
///
/// Entries keep their insertion order. Decoding a record that carries the
/// same key more than once keeps every occurrence; `get` returns the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtProperties {
    // Use `Vec` instead of `HashMap` to keep the order of entries.
    properties: Vec<TxtProperty>,
}

impl TxtProperties {
    /// Returns an iterator for all properties.
    pub fn iter(&self) -> impl Iterator<Item = &TxtProperty> {
        self.properties.iter()
    }

    /// Returns the number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns if the properties are empty.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Returns the first property for a given `key`, where `key` is
    /// case insensitive.
    pub fn get(&self, key: &str) -> Option<&TxtProperty> {
        let key = key.to_lowercase();
        self.properties
            .iter()
            .find(|prop| prop.key.to_lowercase() == key)
    }

    /// Returns a property value string for a given `key`, where `key` is
    /// case insensitive.
    pub fn get_property_val(&self, key: &str) -> Option<&str> {
        self.get(key).map(|x| x.val())
    }
}

/// This trait allows for converting inputs into [`TxtProperties`].
pub trait IntoTxtProperties {
    fn into_txt_properties(self) -> TxtProperties;
}

impl IntoTxtProperties for TxtProperties {
    fn into_txt_properties(self) -> TxtProperties {
        self
    }
}

impl IntoTxtProperties for HashMap<String, String> {
    fn into_txt_properties(mut self) -> TxtProperties {
        let properties = self
            .drain()
            .map(|(key, val)| TxtProperty { key, val })
            .collect();
        TxtProperties { properties }
    }
}

impl IntoTxtProperties for Option<HashMap<String, String>> {
    fn into_txt_properties(self) -> TxtProperties {
        self.map(IntoTxtProperties::into_txt_properties)
            .unwrap_or_default()
    }
}

/// Support slices like `&[("k1", "v1"), ("k2", "v2")]`.
///
/// RFC 6763 section 6.4: "A given key SHOULD NOT appear more than once in a
/// TXT record", so later entries with an already-seen key are dropped here.
impl<'a, T: 'a> IntoTxtProperties for &'a [T]
where
    TxtProperty: From<&'a T>,
{
    fn into_txt_properties(self) -> TxtProperties {
        let mut properties = Vec::new();
        let mut keys = HashSet::new();
        for t in self.iter() {
            let prop = TxtProperty::from(t);
            if keys.insert(prop.key.to_lowercase()) {
                properties.push(prop);
            }
        }
        TxtProperties { properties }
    }
}

/// Encodes properties into TXT record content.
///
/// Fails if any single `key=value` entry would exceed [`TXT_ENTRY_MAX`]
/// bytes. An empty property set encodes as a single zero byte, per RFC 6763.
pub fn encode_txt<'a>(properties: impl Iterator<Item = &'a TxtProperty>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for prop in properties {
        let s = format!("{}={}", prop.key, prop.val);
        if s.len() > TXT_ENTRY_MAX {
            return Err(e_fmt!(
                "TXT entry for key '{}' is {} bytes, exceeding the limit of {}",
                prop.key,
                s.len(),
                TXT_ENTRY_MAX
            ));
        }
        bytes.push(s.len() as u8);
        bytes.extend_from_slice(s.as_bytes());
    }
    if bytes.is_empty() {
        bytes.push(0);
    }
    Ok(bytes)
}

/// Decodes TXT record content into properties.
///
/// Decoding is resilient, not strict: a zero length byte, a length that runs
/// past the end of the buffer, an entry without `=`, or a non-UTF-8 entry
/// stops the walk and returns whatever was parsed so far. Duplicate keys are
/// kept in order.
pub fn decode_txt(txt: &[u8]) -> TxtProperties {
    let mut properties = Vec::new();
    let mut offset = 0;
    while offset < txt.len() {
        let length = txt[offset] as usize;
        if length == 0 || offset + 1 + length > txt.len() {
            break;
        }
        offset += 1; // move over the length byte
        let entry = &txt[offset..offset + length];
        let kv_string = match std::str::from_utf8(entry) {
            Ok(s) => s,
            Err(_) => break,
        };
        let (k, v) = match kv_string.split_once('=') {
            Some(kv) => kv,
            None => break,
        };
        properties.push(TxtProperty::new(k, v));
        offset += length;
    }

    TxtProperties { properties }
}

/// Characters escaped in an instance name besides control and high-bit bytes.
const NAME_RESERVED: &[u8] = b".\\";

fn escape_name_into(out: &mut String, name: &str) {
    for &b in name.as_bytes() {
        if b < 0x20 || b >= 0x80 || NAME_RESERVED.contains(&b) {
            out.push('\\');
            out.push_str(&format!("{:03}", b));
        } else {
            out.push(b as char);
        }
    }
}

/// Assembles an escaped full name from an instance name, a registration
/// type and a domain.
///
/// The instance name gets `\DDD` decimal escapes for bytes below 0x20,
/// at or above 0x80, and for `.` and `\`. The registration type and domain
/// are appended with `.` label separators, and a trailing dot is ensured.
///
/// For example: `("My Printer", "_ipp._tcp", "local.")` assembles to
/// `"My Printer._ipp._tcp.local."`.
///
/// Fails if the assembled name would exceed [`FULL_NAME_MAX`] bytes.
pub fn assemble_full_name(name: &str, regtype: &str, domain: &str) -> Result<String> {
    if name.is_empty() || regtype.is_empty() {
        return Err(e_fmt!("instance name and registration type cannot be empty"));
    }

    let mut full = String::new();
    escape_name_into(&mut full, name);
    full.push('.');
    full.push_str(regtype.trim_end_matches('.'));
    full.push('.');
    if !domain.is_empty() {
        full.push_str(domain.trim_end_matches('.'));
        full.push('.');
    }

    if full.len() > FULL_NAME_MAX {
        return Err(e_fmt!(
            "assembled full name is {} bytes, exceeding the limit of {}",
            full.len(),
            FULL_NAME_MAX
        ));
    }

    Ok(full)
}

/// Consumes one label character at `i`, unescaping `\DDD`.
///
/// Returns the decoded byte and the index just past what was consumed,
/// or `None` at an unescaped `.` or the end of input.
fn next_name_byte(bytes: &[u8], i: usize) -> Option<(u8, usize)> {
    match bytes.get(i)? {
        b'.' => None,
        b'\\' => {
            if i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(u8::is_ascii_digit) {
                let value = (bytes[i + 1] - b'0') as u16 * 100
                    + (bytes[i + 2] - b'0') as u16 * 10
                    + (bytes[i + 3] - b'0') as u16;
                Some((value as u8, i + 4))
            } else {
                // A lone backslash escapes the next character literally.
                bytes.get(i + 1).map(|&b| (b, i + 2))
            }
        }
        &b => Some((b, i + 1)),
    }
}

/// Separates an escaped full name back into (name, regtype, domain).
///
/// The instance name ends at the first unescaped `.`. The registration type
/// accumulates labels for as long as each label begins with `_`, so a
/// multi-label type like `_ipp._tcp` comes back as one field. Whatever
/// remains is the domain.
pub fn separate_full_name(full: &str) -> Result<(String, String, String)> {
    let bytes = full.as_bytes();

    let mut name_bytes = Vec::new();
    let mut i = 0;
    while let Some((b, next)) = next_name_byte(bytes, i) {
        name_bytes.push(b);
        i = next;
    }
    if i >= bytes.len() || name_bytes.is_empty() {
        return Err(e_fmt!("full name '{}' has no instance name part", full));
    }
    i += 1; // the dot after the instance name

    // Registration type: labels while each begins with '_'.
    let mut regtype = String::new();
    while bytes.get(i) == Some(&b'_') {
        let label_end = match bytes[i..].iter().position(|&b| b == b'.') {
            Some(pos) => i + pos,
            None => return Err(e_fmt!("full name '{}' has an unterminated label", full)),
        };
        if !regtype.is_empty() {
            regtype.push('.');
        }
        regtype.push_str(&full[i..label_end]);
        i = label_end + 1;
    }
    if regtype.is_empty() {
        return Err(e_fmt!("full name '{}' has no registration type", full));
    }

    let name = String::from_utf8(name_bytes)
        .map_err(|e| e_fmt!("instance name in '{}' is not valid UTF-8: {}", full, e))?;
    let domain = full[i..].to_string();

    Ok((name, regtype, domain))
}

/// RFC 1876 default size field: a 1 m sphere, encoded as 1 x 10^2 cm.
const LOC_DEFAULT_SIZE: u8 = 0x12;

/// Default uncertainty in meters when the `geo:` URI carries no `u=`.
const LOC_DEFAULT_UNCERTAINTY: f64 = 5.0;

/// Converts meters of uncertainty into an RFC 1876 precision byte:
/// upper nibble is a single mantissa digit, lower nibble a power of ten
/// in centimeters. The exponent is capped at 9.
fn loc_precision(meters: f64) -> u8 {
    let mut cm = (meters * 100.0).round() as u64;
    let mut exponent = 0u8;
    while cm >= 10 && exponent < 9 {
        cm /= 10;
        exponent += 1;
    }
    let mantissa = std::cmp::min(cm, 9) as u8;
    (mantissa << 4) | exponent
}

fn parse_coord(s: &str, what: &str, limit: f64) -> Result<f64> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| Error::ParseGeo(format!("invalid {}: '{}'", what, s)))?;
    if value < -limit || value > limit {
        return Err(Error::ParseGeo(format!("{} {} out of range", what, value)));
    }
    Ok(value)
}

/// Encodes a `geo:` URI into the fixed 16-byte RDATA of a DNS LOC record.
///
/// The URI has the form `geo:LAT,LON[,ALT][;crs=wgs84][;u=UNCERTAINTY]`.
/// Any CRS other than WGS-84 is rejected. Latitude and longitude become
/// 32-bit big-endian thousandths of arc seconds biased by 2^31; altitude
/// becomes 32-bit big-endian centimeters biased by 10,000,000; the
/// uncertainty (default 5 m) becomes the horizontal and vertical precision
/// bytes.
pub fn encode_loc(geo_uri: &str) -> Result<[u8; 16]> {
    let rest = match geo_uri.get(..4) {
        Some(scheme) if scheme.eq_ignore_ascii_case("geo:") => &geo_uri[4..],
        _ => return Err(Error::ParseGeo(format!("not a geo URI: '{}'", geo_uri))),
    };

    let mut parts = rest.split(';');
    let coords = parts.next().unwrap_or_default();

    let mut uncertainty = LOC_DEFAULT_UNCERTAINTY;
    for param in parts {
        let (key, value) = match param.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        if key.eq_ignore_ascii_case("crs") {
            if !value.eq_ignore_ascii_case("wgs84") {
                return Err(Error::ParseGeo(format!("unsupported CRS '{}'", value)));
            }
        } else if key.eq_ignore_ascii_case("u") {
            uncertainty = value
                .parse()
                .map_err(|_| Error::ParseGeo(format!("invalid uncertainty: '{}'", value)))?;
            if uncertainty < 0.0 {
                return Err(Error::ParseGeo(format!(
                    "uncertainty {} cannot be negative",
                    uncertainty
                )));
            }
        }
    }

    let mut fields = coords.split(',');
    let latitude = parse_coord(
        fields
            .next()
            .ok_or_else(|| Error::ParseGeo("missing latitude".into()))?,
        "latitude",
        90.0,
    )?;
    let longitude = parse_coord(
        fields
            .next()
            .ok_or_else(|| Error::ParseGeo("missing longitude".into()))?,
        "longitude",
        180.0,
    )?;
    let altitude = match fields.next() {
        Some(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::ParseGeo(format!("invalid altitude: '{}'", s)))?,
        None => 0.0,
    };

    let precision = loc_precision(uncertainty);
    let lat_field = ((latitude * 3_600_000.0).round() as i64 + (1i64 << 31)) as u32;
    let lon_field = ((longitude * 3_600_000.0).round() as i64 + (1i64 << 31)) as u32;
    let alt_field = ((altitude * 100.0).round() as i64 + 10_000_000) as u32;

    let mut rdata = [0u8; 16];
    rdata[0] = 0; // version
    rdata[1] = LOC_DEFAULT_SIZE;
    rdata[2] = precision; // horizontal
    rdata[3] = precision; // vertical
    rdata[4..8].copy_from_slice(&lat_field.to_be_bytes());
    rdata[8..12].copy_from_slice(&lon_field.to_be_bytes());
    rdata[12..16].copy_from_slice(&alt_field.to_be_bytes());

    Ok(rdata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn test_txt_encode_decode() {
        let properties = vec![
            TxtProperty::new("rp", "ipp/print"),
            TxtProperty::new("note", "2nd floor"),
            TxtProperty::new("rp", "ipp/faxout"), // duplicate key survives
        ];

        let encoded = encode_txt(properties.iter()).unwrap();
        assert_eq!(encoded[0] as usize, "rp=ipp/print".len());

        let decoded = decode_txt(&encoded);
        assert_eq!(decoded.len(), properties.len());
        assert!(decoded.iter().eq(properties.iter()));
        assert_eq!(decoded.get_property_val("RP"), Some("ipp/print"));
    }

    #[test]
    fn test_txt_encode_empty() {
        let no_props: Vec<TxtProperty> = Vec::new();
        let encoded = encode_txt(no_props.iter()).unwrap();
        assert_eq!(encoded, vec![0]);
        assert!(decode_txt(&encoded).is_empty());
    }

    #[test]
    fn test_txt_encode_oversized_entry() {
        let properties = vec![TxtProperty::new("big", "x".repeat(300))];
        assert!(encode_txt(properties.iter()).is_err());
    }

    #[test]
    fn test_txt_decode_stops_early() {
        // Zero length byte first: nothing parsed.
        assert!(decode_txt(&[0, 4, b'a', b'=', b'b', b'c']).is_empty());

        // Length runs past the end of the buffer.
        assert!(decode_txt(&[10, b'a', b'=', b'b']).is_empty());

        // One good entry, then an entry without '=' stops the walk.
        let mut bytes = vec![3, b'a', b'=', b'b'];
        bytes.extend_from_slice(&[3, b'x', b'y', b'z']);
        bytes.extend_from_slice(&[3, b'c', b'=', b'd']);
        let decoded = decode_txt(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get_property_val("a"), Some("b"));
    }

    #[test]
    fn test_full_name_round_trip() {
        let full = assemble_full_name("My Printer", "_ipp._tcp", "local.").unwrap();
        assert_eq!(full, "My Printer._ipp._tcp.local.");

        let (name, regtype, domain) = separate_full_name(&full).unwrap();
        assert_eq!(name, "My Printer");
        assert_eq!(regtype, "_ipp._tcp");
        assert_eq!(domain, "local.");
    }

    #[test]
    fn test_full_name_escapes_reserved() {
        let full = assemble_full_name("dots.and\\slashes", "_http._tcp", "local.").unwrap();
        assert_eq!(full, "dots\\046and\\092slashes._http._tcp.local.");

        let (name, regtype, domain) = separate_full_name(&full).unwrap();
        assert_eq!(name, "dots.and\\slashes");
        assert_eq!(regtype, "_http._tcp");
        assert_eq!(domain, "local.");
    }

    #[test]
    fn test_full_name_escapes_high_bytes() {
        let full = assemble_full_name("Caf\u{e9}", "_ipp._tcp", "local.").unwrap();
        // "é" is two UTF-8 bytes, each escaped separately.
        assert_eq!(full, "Caf\\195\\169._ipp._tcp.local.");

        let (name, _, _) = separate_full_name(&full).unwrap();
        assert_eq!(name, "Caf\u{e9}");
    }

    #[test]
    fn test_separate_multi_label_domain() {
        let (name, regtype, domain) =
            separate_full_name("printer._ipp._tcp.example.com.").unwrap();
        assert_eq!(name, "printer");
        assert_eq!(regtype, "_ipp._tcp");
        assert_eq!(domain, "example.com.");
    }

    #[test]
    fn test_separate_rejects_malformed() {
        assert!(separate_full_name("no-separators").is_err());
        assert!(separate_full_name("name.no-type-label.local.").is_err());
    }

    #[test]
    fn test_assemble_too_long() {
        let name = "x".repeat(FULL_NAME_MAX);
        assert!(assemble_full_name(&name, "_ipp._tcp", "local.").is_err());
    }

    #[test]
    fn test_loc_encode_known_vector() {
        let rdata = encode_loc("geo:37.386,-122.083,30;u=10").unwrap();

        assert_eq!(rdata[0], 0); // version
        assert_eq!(rdata[2], rdata[3]); // horizontal == vertical precision
        assert_eq!(rdata[2], 0x13); // 10 m = 1 x 10^3 cm

        let lat = u32::from_be_bytes(rdata[4..8].try_into().unwrap());
        let lon = u32::from_be_bytes(rdata[8..12].try_into().unwrap());
        let alt = u32::from_be_bytes(rdata[12..16].try_into().unwrap());

        assert_eq!(lat as i64, (37.386f64 * 3_600_000.0).round() as i64 + (1 << 31));
        assert_eq!(lon as i64, (-122.083f64 * 3_600_000.0).round() as i64 + (1 << 31));
        assert_eq!(alt as i64, (30.0f64 * 100.0).round() as i64 + 10_000_000);
    }

    #[test]
    fn test_loc_default_uncertainty() {
        let rdata = encode_loc("geo:0,0").unwrap();
        // Default 5 m = 5 x 10^2 cm.
        assert_eq!(rdata[2], 0x52);
        // No altitude: sea level, i.e. just the bias.
        let alt = u32::from_be_bytes(rdata[12..16].try_into().unwrap());
        assert_eq!(alt, 10_000_000);
    }

    #[test]
    fn test_loc_rejects_bad_input() {
        assert!(encode_loc("geo:37.386,-122.083;crs=nad83").is_err());
        assert!(encode_loc("geo:91.0,0").is_err());
        assert!(encode_loc("geo:0,181.0").is_err());
        assert!(encode_loc("geo:0,0;u=-1").is_err());
        assert!(encode_loc("https://example.com/").is_err());
    }

    #[test]
    fn test_loc_precision_caps_exponent() {
        // 10^12 cm wants exponent 12; it must cap at 9.
        assert_eq!(loc_precision(1e10) & 0x0f, 9);
    }
}
