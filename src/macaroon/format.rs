//! macaroon wire formats
//!
//! Two binary encodings and two JSON encodings are supported:
//!
//! * V2 binary: a leading version byte (2) followed by tagged, varint
//!   length-prefixed fields.
//! * V1 binary: newline-terminated `key value` packets, each prefixed by
//!   four hex digits giving the total packet length.
//! * V2 JSON: short field names (`i`/`i64`, `v64`, `s64`), binary values
//!   base64url encoded.
//! * V1 JSON: long field names, hex signature.
//!
//! Deserialization accepts any of the four and records the version on the
//! macaroon; serialization follows the macaroon's version. Unknown versions
//! are rejected.

use serde::{Deserialize, Serialize};

use super::{Caveat, Macaroon, Version, SIG_LEN};
use crate::error::{Error, FormatError};

const FIELD_EOS: u64 = 0;
const FIELD_LOCATION: u64 = 1;
const FIELD_IDENTIFIER: u64 = 2;
const FIELD_VID: u64 = 4;
const FIELD_SIGNATURE: u64 = 6;

// V1 packets carry a four-hex-digit total length.
const V1_MAX_PACKET: usize = 0xffff;

impl Macaroon {
    /// serializes the macaroon in its version's binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match self.version {
            Version::V1 => self.to_bytes_v1(),
            Version::V2 => Ok(self.to_bytes_v2()),
        }
    }

    /// deserializes a macaroon from either binary format
    pub fn from_bytes(data: &[u8]) -> Result<Macaroon, Error> {
        match data.first() {
            None => Err(FormatError::Deserialization("empty macaroon data".to_owned()).into()),
            Some(&2) => Macaroon::from_bytes_v2(data),
            // V1 packets start with a hex digit.
            Some(b) if b.is_ascii_hexdigit() => Macaroon::from_bytes_v1(data),
            Some(&b) => Err(FormatError::UnknownVersion(u32::from(b)).into()),
        }
    }

    /// serializes the binary format, base64url encoded
    pub fn to_base64(&self) -> Result<String, Error> {
        Ok(base64::encode_config(self.to_bytes()?, base64::URL_SAFE_NO_PAD))
    }

    /// deserializes from the base64url encoded binary format
    pub fn from_base64<T: AsRef<[u8]>>(data: T) -> Result<Macaroon, Error> {
        let decoded = base64::decode_config(data, base64::URL_SAFE_NO_PAD)?;
        Macaroon::from_bytes(&decoded)
    }

    /// serializes the macaroon in its version's JSON format
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| FormatError::Serialization(e.to_string()).into())
    }

    /// deserializes a macaroon from either JSON format
    pub fn from_json(data: &str) -> Result<Macaroon, Error> {
        serde_json::from_str(data).map_err(|e| FormatError::Deserialization(e.to_string()).into())
    }

    fn to_bytes_v2(&self) -> Vec<u8> {
        let mut buf = vec![2u8];
        if !self.location.is_empty() {
            put_packet(&mut buf, FIELD_LOCATION, self.location.as_bytes());
        }
        put_packet(&mut buf, FIELD_IDENTIFIER, &self.id);
        put_packet(&mut buf, FIELD_EOS, &[]);
        for cav in &self.caveats {
            if !cav.location.is_empty() {
                put_packet(&mut buf, FIELD_LOCATION, cav.location.as_bytes());
            }
            put_packet(&mut buf, FIELD_IDENTIFIER, &cav.id);
            if !cav.verification_id.is_empty() {
                put_packet(&mut buf, FIELD_VID, &cav.verification_id);
            }
            put_packet(&mut buf, FIELD_EOS, &[]);
        }
        put_packet(&mut buf, FIELD_EOS, &[]);
        put_packet(&mut buf, FIELD_SIGNATURE, &self.signature);
        buf
    }

    fn from_bytes_v2(data: &[u8]) -> Result<Macaroon, Error> {
        let mut pos = 1;
        let (field, value) = read_packet(data, &mut pos)?;
        let (location, id) = if field == FIELD_LOCATION {
            let loc = String::from_utf8(value.to_vec())
                .map_err(|_| deser("location is not valid utf-8"))?;
            let (field, value) = read_packet(data, &mut pos)?;
            if field != FIELD_IDENTIFIER {
                return Err(deser("expected identifier field").into());
            }
            (loc, value.to_vec())
        } else if field == FIELD_IDENTIFIER {
            (String::new(), value.to_vec())
        } else {
            return Err(deser("expected location or identifier field").into());
        };
        expect_eos(data, &mut pos)?;

        let mut caveats = Vec::new();
        loop {
            let (field, value) = read_packet(data, &mut pos)?;
            if field == FIELD_EOS {
                break;
            }
            let (cav_location, cav_id) = if field == FIELD_LOCATION {
                let loc = String::from_utf8(value.to_vec())
                    .map_err(|_| deser("caveat location is not valid utf-8"))?;
                let (field, value) = read_packet(data, &mut pos)?;
                if field != FIELD_IDENTIFIER {
                    return Err(deser("expected caveat identifier field").into());
                }
                (loc, value.to_vec())
            } else if field == FIELD_IDENTIFIER {
                (String::new(), value.to_vec())
            } else {
                return Err(deser("expected caveat location or identifier field").into());
            };
            let (field, value) = read_packet(data, &mut pos)?;
            let verification_id = if field == FIELD_VID {
                let vid = value.to_vec();
                expect_eos(data, &mut pos)?;
                vid
            } else if field == FIELD_EOS {
                Vec::new()
            } else {
                return Err(deser("expected caveat verification id field").into());
            };
            caveats.push(Caveat {
                id: cav_id,
                verification_id,
                location: cav_location,
            });
        }

        let (field, value) = read_packet(data, &mut pos)?;
        if field != FIELD_SIGNATURE {
            return Err(deser("expected signature field").into());
        }
        let signature: [u8; SIG_LEN] = value
            .try_into()
            .map_err(|_| deser("signature must be 32 bytes"))?;
        if pos != data.len() {
            return Err(deser("trailing data after signature").into());
        }
        Ok(Macaroon {
            location,
            id,
            caveats,
            signature,
            version: Version::V2,
        })
    }

    fn to_bytes_v1(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        put_packet_v1(&mut buf, "location", self.location.as_bytes())?;
        put_packet_v1(&mut buf, "identifier", &self.id)?;
        for cav in &self.caveats {
            put_packet_v1(&mut buf, "cid", &cav.id)?;
            if cav.is_third_party() {
                put_packet_v1(&mut buf, "vid", &cav.verification_id)?;
                put_packet_v1(&mut buf, "cl", cav.location.as_bytes())?;
            }
        }
        put_packet_v1(&mut buf, "signature", &self.signature)?;
        Ok(buf)
    }

    fn from_bytes_v1(data: &[u8]) -> Result<Macaroon, Error> {
        let mut pos = 0;
        let mut location = None;
        let mut id = None;
        let mut caveats: Vec<Caveat> = Vec::new();
        let mut signature = None;
        while pos < data.len() {
            let (key, value) = read_packet_v1(data, &mut pos)?;
            match key {
                "location" => {
                    location = Some(
                        String::from_utf8(value.to_vec())
                            .map_err(|_| deser("location is not valid utf-8"))?,
                    )
                }
                "identifier" => id = Some(value.to_vec()),
                "cid" => caveats.push(Caveat {
                    id: value.to_vec(),
                    verification_id: Vec::new(),
                    location: String::new(),
                }),
                "vid" => match caveats.last_mut() {
                    Some(cav) => cav.verification_id = value.to_vec(),
                    None => return Err(deser("verification id without caveat").into()),
                },
                "cl" => match caveats.last_mut() {
                    Some(cav) => {
                        cav.location = String::from_utf8(value.to_vec())
                            .map_err(|_| deser("caveat location is not valid utf-8"))?
                    }
                    None => return Err(deser("caveat location without caveat").into()),
                },
                "signature" => {
                    signature = Some(
                        <[u8; SIG_LEN]>::try_from(value)
                            .map_err(|_| deser("signature must be 32 bytes"))?,
                    )
                }
                other => return Err(deser(&format!("unexpected field {:?}", other)).into()),
            }
        }
        Ok(Macaroon {
            location: location.ok_or_else(|| deser("missing location"))?,
            id: id.ok_or_else(|| deser("missing identifier"))?,
            caveats,
            signature: signature.ok_or_else(|| deser("missing signature"))?,
            version: Version::V1,
        })
    }
}

fn deser(msg: &str) -> FormatError {
    FormatError::Deserialization(msg.to_owned())
}

fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

fn take_uvarint(data: &[u8], pos: &mut usize) -> Result<u64, FormatError> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or_else(|| deser("truncated varint"))?;
        *pos += 1;
        if shift >= 63 && byte > 1 {
            return Err(deser("varint overflow"));
        }
        x |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(x);
        }
        shift += 7;
    }
}

fn put_packet(buf: &mut Vec<u8>, field: u64, data: &[u8]) {
    put_uvarint(buf, field);
    if field != FIELD_EOS {
        put_uvarint(buf, data.len() as u64);
        buf.extend_from_slice(data);
    }
}

fn read_packet<'a>(data: &'a [u8], pos: &mut usize) -> Result<(u64, &'a [u8]), FormatError> {
    let field = take_uvarint(data, pos)?;
    if field == FIELD_EOS {
        return Ok((field, &[]));
    }
    let len = take_uvarint(data, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| deser("truncated packet"))?;
    let value = &data[*pos..end];
    *pos = end;
    Ok((field, value))
}

fn expect_eos(data: &[u8], pos: &mut usize) -> Result<(), FormatError> {
    let (field, _) = read_packet(data, pos)?;
    if field != FIELD_EOS {
        return Err(deser("expected end of section"));
    }
    Ok(())
}

fn put_packet_v1(buf: &mut Vec<u8>, key: &str, value: &[u8]) -> Result<(), Error> {
    // 4 hex digits + key + space + value + newline
    let total = 4 + key.len() + 1 + value.len() + 1;
    if total > V1_MAX_PACKET {
        return Err(FormatError::Serialization(format!("field {} too long", key)).into());
    }
    buf.extend_from_slice(format!("{:04x}", total).as_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(value);
    buf.push(b'\n');
    Ok(())
}

fn read_packet_v1<'a>(data: &'a [u8], pos: &mut usize) -> Result<(&'a str, &'a [u8]), FormatError> {
    if *pos + 4 > data.len() {
        return Err(deser("truncated packet header"));
    }
    let header = std::str::from_utf8(&data[*pos..*pos + 4])
        .map_err(|_| deser("packet length is not hex"))?;
    let total = usize::from_str_radix(header, 16).map_err(|_| deser("packet length is not hex"))?;
    if total < 6 || *pos + total > data.len() {
        return Err(deser("invalid packet length"));
    }
    let body = &data[*pos + 4..*pos + total];
    let (body, newline) = body.split_at(body.len() - 1);
    if newline != b"\n" {
        return Err(deser("packet does not end with newline"));
    }
    let space = body
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| deser("packet has no key"))?;
    let key = std::str::from_utf8(&body[..space]).map_err(|_| deser("packet key is not utf-8"))?;
    *pos += total;
    Ok((key, &body[space + 1..]))
}

#[derive(Serialize, Deserialize)]
struct MacaroonJsonV2 {
    v: u32,
    #[serde(rename = "l", skip_serializing_if = "Option::is_none", default)]
    location: Option<String>,
    #[serde(rename = "i", skip_serializing_if = "Option::is_none", default)]
    identifier: Option<String>,
    #[serde(rename = "i64", skip_serializing_if = "Option::is_none", default)]
    identifier64: Option<String>,
    #[serde(rename = "c", skip_serializing_if = "Vec::is_empty", default)]
    caveats: Vec<CaveatJsonV2>,
    #[serde(rename = "s64")]
    signature64: String,
}

#[derive(Serialize, Deserialize)]
struct CaveatJsonV2 {
    #[serde(rename = "i", skip_serializing_if = "Option::is_none", default)]
    identifier: Option<String>,
    #[serde(rename = "i64", skip_serializing_if = "Option::is_none", default)]
    identifier64: Option<String>,
    #[serde(rename = "v64", skip_serializing_if = "Option::is_none", default)]
    verification_id64: Option<String>,
    #[serde(rename = "l", skip_serializing_if = "Option::is_none", default)]
    location: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MacaroonJsonV1 {
    location: String,
    identifier: String,
    #[serde(default)]
    caveats: Vec<CaveatJsonV1>,
    signature: String,
}

#[derive(Serialize, Deserialize)]
struct CaveatJsonV1 {
    cid: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    vid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    cl: Option<String>,
}

fn split_id(id: &[u8]) -> (Option<String>, Option<String>) {
    match std::str::from_utf8(id) {
        Ok(s) => (Some(s.to_owned()), None),
        Err(_) => (
            None,
            Some(base64::encode_config(id, base64::URL_SAFE_NO_PAD)),
        ),
    }
}

fn join_id(
    identifier: Option<String>,
    identifier64: Option<String>,
) -> Result<Vec<u8>, FormatError> {
    match (identifier, identifier64) {
        (Some(s), None) => Ok(s.into_bytes()),
        (None, Some(b)) => base64::decode_config(b, base64::URL_SAFE_NO_PAD)
            .map_err(|e| FormatError::Base64(e.to_string())),
        _ => Err(deser("exactly one of i and i64 must be set")),
    }
}

impl Serialize for Macaroon {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.version {
            Version::V2 => {
                let (identifier, identifier64) = split_id(&self.id);
                let caveats = self
                    .caveats
                    .iter()
                    .map(|cav| {
                        let (identifier, identifier64) = split_id(&cav.id);
                        CaveatJsonV2 {
                            identifier,
                            identifier64,
                            verification_id64: if cav.verification_id.is_empty() {
                                None
                            } else {
                                Some(base64::encode_config(
                                    &cav.verification_id,
                                    base64::URL_SAFE_NO_PAD,
                                ))
                            },
                            location: if cav.location.is_empty() {
                                None
                            } else {
                                Some(cav.location.clone())
                            },
                        }
                    })
                    .collect();
                MacaroonJsonV2 {
                    v: 2,
                    location: if self.location.is_empty() {
                        None
                    } else {
                        Some(self.location.clone())
                    },
                    identifier,
                    identifier64,
                    caveats,
                    signature64: base64::encode_config(self.signature, base64::URL_SAFE_NO_PAD),
                }
                .serialize(serializer)
            }
            Version::V1 => {
                let identifier = std::str::from_utf8(&self.id)
                    .map_err(|_| serde::ser::Error::custom("V1 identifier must be utf-8"))?
                    .to_owned();
                let caveats = self
                    .caveats
                    .iter()
                    .map(|cav| {
                        let cid = std::str::from_utf8(&cav.id)
                            .map_err(|_| serde::ser::Error::custom("V1 caveat id must be utf-8"))?
                            .to_owned();
                        Ok(CaveatJsonV1 {
                            cid,
                            vid: if cav.verification_id.is_empty() {
                                None
                            } else {
                                Some(base64::encode_config(
                                    &cav.verification_id,
                                    base64::URL_SAFE_NO_PAD,
                                ))
                            },
                            cl: if cav.location.is_empty() {
                                None
                            } else {
                                Some(cav.location.clone())
                            },
                        })
                    })
                    .collect::<Result<Vec<_>, S::Error>>()?;
                MacaroonJsonV1 {
                    location: self.location.clone(),
                    identifier,
                    caveats,
                    signature: hex::encode(self.signature),
                }
                .serialize(serializer)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Macaroon {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Macaroon, D::Error> {
        use serde::de::Error as DeError;
        let value = serde_json::Value::deserialize(deserializer)?;
        if let Some(v) = value.get("v") {
            let v = v.as_u64().unwrap_or(0) as u32;
            if v != 2 {
                return Err(DeError::custom(FormatError::UnknownVersion(v).to_string()));
            }
            let m: MacaroonJsonV2 =
                serde_json::from_value(value).map_err(DeError::custom)?;
            let id = join_id(m.identifier, m.identifier64).map_err(DeError::custom)?;
            let caveats = m
                .caveats
                .into_iter()
                .map(|cav| {
                    let id = join_id(cav.identifier, cav.identifier64)?;
                    let verification_id = match cav.verification_id64 {
                        Some(v64) => base64::decode_config(v64, base64::URL_SAFE_NO_PAD)
                            .map_err(|e| FormatError::Base64(e.to_string()))?,
                        None => Vec::new(),
                    };
                    Ok(Caveat {
                        id,
                        verification_id,
                        location: cav.location.unwrap_or_default(),
                    })
                })
                .collect::<Result<Vec<_>, FormatError>>()
                .map_err(DeError::custom)?;
            let signature: [u8; SIG_LEN] =
                base64::decode_config(m.signature64, base64::URL_SAFE_NO_PAD)
                    .map_err(DeError::custom)?
                    .as_slice()
                    .try_into()
                    .map_err(|_| DeError::custom("signature must be 32 bytes"))?;
            Ok(Macaroon {
                location: m.location.unwrap_or_default(),
                id,
                caveats,
                signature,
                version: Version::V2,
            })
        } else {
            let m: MacaroonJsonV1 =
                serde_json::from_value(value).map_err(DeError::custom)?;
            let caveats = m
                .caveats
                .into_iter()
                .map(|cav| {
                    let verification_id = match cav.vid {
                        Some(vid) => base64::decode_config(vid, base64::URL_SAFE_NO_PAD)
                            .map_err(|e| FormatError::Base64(e.to_string()))?,
                        None => Vec::new(),
                    };
                    Ok(Caveat {
                        id: cav.cid.into_bytes(),
                        verification_id,
                        location: cav.cl.unwrap_or_default(),
                    })
                })
                .collect::<Result<Vec<_>, FormatError>>()
                .map_err(DeError::custom)?;
            let signature: [u8; SIG_LEN] = hex::decode(&m.signature)
                .map_err(DeError::custom)?
                .as_slice()
                .try_into()
                .map_err(|_| DeError::custom("signature must be 32 bytes"))?;
            Ok(Macaroon {
                location: m.location,
                id: m.identifier.into_bytes(),
                caveats,
                signature,
                version: Version::V1,
            })
        }
    }
}
