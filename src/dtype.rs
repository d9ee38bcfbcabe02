use std::fmt;

/// Logical element type of a tensor.
///
/// Storage is always `f32`; the tag records what the values mean so that integral
/// index tensors and boolean masks can flow through the same API without ever
/// being asked for gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    I64,
    Bool,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        }
    }

    pub fn parse(s: &str) -> Option<DType> {
        match s.to_lowercase().as_str() {
            "f32" | "float32" | "float" => Some(DType::F32),
            "i64" | "int64" | "int" | "long" => Some(DType::I64),
            "bool" | "boolean" => Some(DType::Bool),
            _ => None,
        }
    }

    /// Only floating point tensors can carry gradients.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
