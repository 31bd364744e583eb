//! Owned attribute storage and template matching.

use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FALSE, CK_TRUE, CK_ULONG};

/// A single `(type, value)` attribute. The value bytes are owned by the
/// attribute and live as long as the object that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn bytes(kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self { kind, value: value.into() }
    }

    /// CK_ULONG attributes are stored in native byte order, exactly as a C
    /// caller would memcpy them out.
    pub fn ulong(kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self { kind, value: value.to_ne_bytes().to_vec() }
    }

    pub fn bool(kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        let b: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
        Self { kind, value: vec![b] }
    }

    pub fn label(kind: CK_ATTRIBUTE_TYPE, value: &str) -> Self {
        Self { kind, value: value.as_bytes().to_vec() }
    }
}

/// One entry of a search template. `value: None` mirrors a caller template
/// attribute whose value pointer was null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateAttribute {
    pub kind: CK_ATTRIBUTE_TYPE,
    pub value: Option<Vec<u8>>,
}

impl TemplateAttribute {
    pub fn new(kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self { kind, value: Some(value.into()) }
    }
}

/// Find an attribute by type within an object's attribute list.
pub fn find_attribute(attrs: &[Attribute], kind: CK_ATTRIBUTE_TYPE) -> Option<&Attribute> {
    attrs.iter().find(|attr| attr.kind == kind)
}

/// Template equality matching: every template entry must find an attribute
/// with the same type, the same length, and byte-identical contents. An
/// empty template matches everything.
pub fn matches_template(attrs: &[Attribute], template: &[TemplateAttribute]) -> bool {
    template.iter().all(|wanted| {
        attrs.iter().any(|attr| {
            attr.kind == wanted.kind
                && match &wanted.value {
                    Some(value) => attr.value == *value,
                    // A null template value only matches a null object
                    // value, which owned attributes never have.
                    None => false,
                }
        })
    })
}
