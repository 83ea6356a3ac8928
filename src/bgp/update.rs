//! BGP UPDATE message: withdrawn routes, path attributes and NLRI.

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::DecodeError;
use super::prefix::Prefix;

/// Path attribute type codes understood by this speaker.
pub mod attr_type {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const LOCAL_PREF: u8 = 5;
}

/// Attributes that must accompany any UPDATE carrying NLRI.
const MANDATORY_ATTRIBUTES: [u8; 3] = [attr_type::ORIGIN, attr_type::AS_PATH, attr_type::NEXT_HOP];

/// Path attribute flags octet.
///
/// The extended-length bit only describes the wire encoding: `encode` sets it
/// when the value needs a two-byte length and `decode` clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrFlags(pub u8);

impl AttrFlags {
    pub const OPTIONAL: u8 = 0x80;
    pub const TRANSITIVE: u8 = 0x40;
    pub const PARTIAL: u8 = 0x20;
    pub const EXTENDED_LENGTH: u8 = 0x10;

    /// Flags for a well-known attribute (transitive, not optional).
    pub fn well_known() -> Self {
        Self(Self::TRANSITIVE)
    }

    pub fn is_optional(&self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }

    pub fn is_transitive(&self) -> bool {
        self.0 & Self::TRANSITIVE != 0
    }

    pub fn is_extended_length(&self) -> bool {
        self.0 & Self::EXTENDED_LENGTH != 0
    }
}

/// BGP ORIGIN attribute values. Lower is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

impl TryFrom<u8> for Origin {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            other => Err(other),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Igp => write!(f, "IGP"),
            Origin::Egp => write!(f, "EGP"),
            Origin::Incomplete => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentType {
    Set = 1,
    Sequence = 2,
}

/// AS_PATH as a single segment of 16-bit AS numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsPath {
    pub segment_type: SegmentType,
    pub asns: Vec<u16>,
}

impl AsPath {
    pub fn sequence(asns: Vec<u16>) -> Self {
        Self {
            segment_type: SegmentType::Sequence,
            asns,
        }
    }

    /// Path length as used by best-path selection. An AS_SET counts as one hop.
    pub fn path_len(&self) -> usize {
        match self.segment_type {
            SegmentType::Sequence => self.asns.len(),
            SegmentType::Set if self.asns.is_empty() => 0,
            SegmentType::Set => 1,
        }
    }

    pub fn contains(&self, asn: u16) -> bool {
        self.asns.contains(&asn)
    }

    /// Returns a new AS_SEQUENCE with `asn` in front.
    pub fn prepend(&self, asn: u16) -> Self {
        let mut asns = Vec::with_capacity(self.asns.len() + 1);
        asns.push(asn);
        asns.extend_from_slice(&self.asns);
        Self::sequence(asns)
    }

    fn encode(&self, buf: &mut BytesMut) {
        if self.asns.is_empty() {
            buf.put_u8(self.segment_type as u8);
            buf.put_u8(0);
            return;
        }
        // Paths longer than 255 hops span several segments of the same type.
        for chunk in self.asns.chunks(u8::MAX as usize) {
            buf.put_u8(self.segment_type as u8);
            buf.put_u8(chunk.len() as u8);
            for asn in chunk {
                buf.put_u16(*asn);
            }
        }
    }

    fn decode(value: &mut impl Buf) -> Result<Self, DecodeError> {
        let mut path: Option<AsPath> = None;

        while value.has_remaining() {
            if value.remaining() < 2 {
                return Err(DecodeError::malformed(attr_type::AS_PATH, "segment header truncated"));
            }
            let segment_type = match value.get_u8() {
                1 => SegmentType::Set,
                2 => SegmentType::Sequence,
                other => {
                    return Err(DecodeError::malformed(
                        attr_type::AS_PATH,
                        format!("unknown segment type {}", other),
                    ))
                }
            };
            let count = value.get_u8() as usize;
            if value.remaining() < count * 2 {
                return Err(DecodeError::malformed(attr_type::AS_PATH, "segment length exceeds attribute"));
            }

            let path = path.get_or_insert_with(|| AsPath {
                segment_type,
                asns: Vec::with_capacity(count),
            });
            if path.segment_type != segment_type {
                return Err(DecodeError::malformed(attr_type::AS_PATH, "mixed segment types"));
            }
            for _ in 0..count {
                path.asns.push(value.get_u16());
            }
        }

        Ok(path.unwrap_or_else(|| AsPath::sequence(Vec::new())))
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .asns
            .iter()
            .map(|asn| asn.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        match self.segment_type {
            SegmentType::Sequence => write!(f, "{}", joined),
            SegmentType::Set => write!(f, "{{{}}}", joined),
        }
    }
}

/// Value of a path attribute, typed for the attributes this speaker understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeValue {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    LocalPref(u32),
    /// Unrecognized attribute, carried through untouched.
    Unknown { type_code: u8, data: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAttribute {
    pub flags: AttrFlags,
    pub value: AttributeValue,
}

impl PathAttribute {
    pub fn origin(origin: Origin) -> Self {
        Self {
            flags: AttrFlags::well_known(),
            value: AttributeValue::Origin(origin),
        }
    }

    pub fn as_path(path: AsPath) -> Self {
        Self {
            flags: AttrFlags::well_known(),
            value: AttributeValue::AsPath(path),
        }
    }

    pub fn next_hop(addr: Ipv4Addr) -> Self {
        Self {
            flags: AttrFlags::well_known(),
            value: AttributeValue::NextHop(addr),
        }
    }

    pub fn local_pref(pref: u32) -> Self {
        Self {
            flags: AttrFlags::well_known(),
            value: AttributeValue::LocalPref(pref),
        }
    }

    pub fn type_code(&self) -> u8 {
        match &self.value {
            AttributeValue::Origin(_) => attr_type::ORIGIN,
            AttributeValue::AsPath(_) => attr_type::AS_PATH,
            AttributeValue::NextHop(_) => attr_type::NEXT_HOP,
            AttributeValue::LocalPref(_) => attr_type::LOCAL_PREF,
            AttributeValue::Unknown { type_code, .. } => *type_code,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut value = BytesMut::new();
        match &self.value {
            AttributeValue::Origin(origin) => value.put_u8(*origin as u8),
            AttributeValue::AsPath(path) => path.encode(&mut value),
            AttributeValue::NextHop(addr) => value.put_slice(&addr.octets()),
            AttributeValue::LocalPref(pref) => value.put_u32(*pref),
            AttributeValue::Unknown { data, .. } => value.put_slice(data),
        }

        // A value that does not fit in one length octet forces the extended-length flag.
        let mut flags = self.flags.0;
        if value.len() > u8::MAX as usize {
            flags |= AttrFlags::EXTENDED_LENGTH;
        }

        buf.put_u8(flags);
        buf.put_u8(self.type_code());
        if flags & AttrFlags::EXTENDED_LENGTH != 0 {
            buf.put_u16(value.len() as u16);
        } else {
            buf.put_u8(value.len() as u8);
        }
        buf.put(value);
    }

    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if data.remaining() < 2 {
            return Err(DecodeError::TruncatedMessage);
        }
        let flags = AttrFlags(data.get_u8());
        let type_code = data.get_u8();

        let len = if flags.is_extended_length() {
            if data.remaining() < 2 {
                return Err(DecodeError::TruncatedMessage);
            }
            data.get_u16() as usize
        } else {
            if !data.has_remaining() {
                return Err(DecodeError::TruncatedMessage);
            }
            data.get_u8() as usize
        };
        if data.remaining() < len {
            return Err(DecodeError::TruncatedMessage);
        }
        let mut value = data.copy_to_bytes(len);

        let value = match type_code {
            attr_type::ORIGIN => {
                expect_len(type_code, &value, 1)?;
                let origin = Origin::try_from(value.get_u8()).map_err(|v| {
                    DecodeError::malformed(type_code, format!("unknown origin {}", v))
                })?;
                AttributeValue::Origin(origin)
            }
            attr_type::AS_PATH => AttributeValue::AsPath(AsPath::decode(&mut value)?),
            attr_type::NEXT_HOP => {
                expect_len(type_code, &value, 4)?;
                AttributeValue::NextHop(Ipv4Addr::from(value.get_u32()))
            }
            attr_type::LOCAL_PREF => {
                expect_len(type_code, &value, 4)?;
                AttributeValue::LocalPref(value.get_u32())
            }
            _ => AttributeValue::Unknown {
                type_code,
                data: value,
            },
        };

        Ok(Self {
            flags: AttrFlags(flags.0 & !AttrFlags::EXTENDED_LENGTH),
            value,
        })
    }
}

fn expect_len(type_code: u8, value: &Bytes, expected: usize) -> Result<(), DecodeError> {
    if value.len() != expected {
        return Err(DecodeError::malformed(
            type_code,
            format!("length {} (expected {})", value.len(), expected),
        ));
    }
    Ok(())
}

/// A decoded UPDATE body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn new(withdrawn: Vec<Prefix>, attributes: Vec<PathAttribute>, nlri: Vec<Prefix>) -> Self {
        Self {
            withdrawn,
            attributes,
            nlri,
        }
    }

    /// An UPDATE that only withdraws routes.
    pub fn withdraw(prefixes: Vec<Prefix>) -> Self {
        Self {
            withdrawn: prefixes,
            ..Default::default()
        }
    }

    pub fn is_withdraw_only(&self) -> bool {
        self.nlri.is_empty() && !self.withdrawn.is_empty()
    }

    pub fn origin(&self) -> Option<Origin> {
        self.attributes.iter().find_map(|attr| match attr.value {
            AttributeValue::Origin(origin) => Some(origin),
            _ => None,
        })
    }

    pub fn as_path(&self) -> Option<&AsPath> {
        self.attributes.iter().find_map(|attr| match &attr.value {
            AttributeValue::AsPath(path) => Some(path),
            _ => None,
        })
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.attributes.iter().find_map(|attr| match attr.value {
            AttributeValue::NextHop(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn local_pref(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr.value {
            AttributeValue::LocalPref(pref) => Some(pref),
            _ => None,
        })
    }

    /// Encode the UPDATE body (without header).
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut withdrawn = BytesMut::new();
        for prefix in &self.withdrawn {
            prefix.encode(&mut withdrawn);
        }
        buf.put_u16(withdrawn.len() as u16);
        buf.put(withdrawn);

        let mut attributes = BytesMut::new();
        for attr in &self.attributes {
            attr.encode(&mut attributes);
        }
        buf.put_u16(attributes.len() as u16);
        buf.put(attributes);

        for prefix in &self.nlri {
            prefix.encode(buf);
        }
    }

    /// Decode an UPDATE body (without header).
    pub fn decode(data: &mut impl Buf) -> Result<Self, DecodeError> {
        if data.remaining() < 2 {
            return Err(DecodeError::TruncatedMessage);
        }
        let withdrawn_len = data.get_u16() as usize;
        if data.remaining() < withdrawn_len {
            return Err(DecodeError::TruncatedMessage);
        }
        let withdrawn = Prefix::decode_all(&mut data.copy_to_bytes(withdrawn_len))?;

        if data.remaining() < 2 {
            return Err(DecodeError::TruncatedMessage);
        }
        let attr_len = data.get_u16() as usize;
        if data.remaining() < attr_len {
            return Err(DecodeError::TruncatedMessage);
        }
        let mut attr_data = data.copy_to_bytes(attr_len);
        let mut attributes = Vec::new();
        while attr_data.has_remaining() {
            attributes.push(PathAttribute::decode(&mut attr_data)?);
        }

        let nlri = Prefix::decode_all(data)?;

        if !nlri.is_empty() {
            for required in MANDATORY_ATTRIBUTES {
                if !attributes.iter().any(|attr| attr.type_code() == required) {
                    return Err(DecodeError::MissingAttribute(required));
                }
            }
        }

        Ok(Self {
            withdrawn,
            attributes,
            nlri,
        })
    }
}
