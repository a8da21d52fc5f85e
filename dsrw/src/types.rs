use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Type codes as they appear in element descriptors on the wire
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum TypeCode {
    None = 0,
    Float = 1,
    Double = 2,
    Byte = 3,
    Int = 4,
    Short = 5,
    Array = 6,
    List = 7,
    MultiArray = 8,
    Complex = 9,
    DComplex = 10,
    BComplex = 11,
    IComplex = 12,
    SComplex = 13,
    Long = 14,
    LComplex = 15,
    UByte = 16,
    UInt = 17,
    UIComplex = 18,
    UShort = 19,
    USComplex = 20,
    ULong = 21,
    ULComplex = 22,
    UBComplex = 23,
    VString = 24,
    FString = 25,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl Scalar {
    pub fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::I64 | Scalar::U64 | Scalar::F64 => 8,
        }
    }
}

/// A numeric element type: a scalar, or a complex number consisting of two scalars (real part
///  first)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AtomicType {
    pub scalar: Scalar,
    pub complex: bool,
}

impl AtomicType {
    pub const fn real(scalar: Scalar) -> AtomicType {
        AtomicType { scalar, complex: false }
    }

    pub const fn complex(scalar: Scalar) -> AtomicType {
        AtomicType { scalar, complex: true }
    }

    pub fn size(self) -> usize {
        if self.complex {
            2 * self.scalar.size()
        }
        else {
            self.scalar.size()
        }
    }

    pub fn type_code(self) -> TypeCode {
        use Scalar::*;
        match (self.scalar, self.complex) {
            (I8, false) => TypeCode::Byte,
            (U8, false) => TypeCode::UByte,
            (I16, false) => TypeCode::Short,
            (U16, false) => TypeCode::UShort,
            (I32, false) => TypeCode::Int,
            (U32, false) => TypeCode::UInt,
            (I64, false) => TypeCode::Long,
            (U64, false) => TypeCode::ULong,
            (F32, false) => TypeCode::Float,
            (F64, false) => TypeCode::Double,
            (I8, true) => TypeCode::BComplex,
            (U8, true) => TypeCode::UBComplex,
            (I16, true) => TypeCode::SComplex,
            (U16, true) => TypeCode::USComplex,
            (I32, true) => TypeCode::IComplex,
            (U32, true) => TypeCode::UIComplex,
            (I64, true) => TypeCode::LComplex,
            (U64, true) => TypeCode::ULComplex,
            (F32, true) => TypeCode::Complex,
            (F64, true) => TypeCode::DComplex,
        }
    }

    /// `None` for the non-atomic codes
    pub fn from_type_code(code: TypeCode) -> Option<AtomicType> {
        use Scalar::*;
        let result = match code {
            TypeCode::Byte => AtomicType::real(I8),
            TypeCode::UByte => AtomicType::real(U8),
            TypeCode::Short => AtomicType::real(I16),
            TypeCode::UShort => AtomicType::real(U16),
            TypeCode::Int => AtomicType::real(I32),
            TypeCode::UInt => AtomicType::real(U32),
            TypeCode::Long => AtomicType::real(I64),
            TypeCode::ULong => AtomicType::real(U64),
            TypeCode::Float => AtomicType::real(F32),
            TypeCode::Double => AtomicType::real(F64),
            TypeCode::BComplex => AtomicType::complex(I8),
            TypeCode::UBComplex => AtomicType::complex(U8),
            TypeCode::SComplex => AtomicType::complex(I16),
            TypeCode::USComplex => AtomicType::complex(U16),
            TypeCode::IComplex => AtomicType::complex(I32),
            TypeCode::UIComplex => AtomicType::complex(U32),
            TypeCode::LComplex => AtomicType::complex(I64),
            TypeCode::ULComplex => AtomicType::complex(U64),
            TypeCode::Complex => AtomicType::complex(F32),
            TypeCode::DComplex => AtomicType::complex(F64),
            TypeCode::None
            | TypeCode::Array
            | TypeCode::List
            | TypeCode::MultiArray
            | TypeCode::VString
            | TypeCode::FString => return None,
        };
        Some(result)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ScalarValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

macro_rules! scalar_codec {
    ($put: ident, $get: ident,
        $put_i16: ident, $put_u16: ident, $put_i32: ident, $put_u32: ident,
        $put_i64: ident, $put_u64: ident, $put_f32: ident, $put_f64: ident,
        $get_i16: ident, $get_u16: ident, $get_i32: ident, $get_u32: ident,
        $get_i64: ident, $get_u64: ident, $get_f32: ident, $get_f64: ident) => {

        pub fn $put(&self, buf: &mut impl BufMut) {
            match *self {
                ScalarValue::I8(v) => buf.put_i8(v),
                ScalarValue::U8(v) => buf.put_u8(v),
                ScalarValue::I16(v) => buf.$put_i16(v),
                ScalarValue::U16(v) => buf.$put_u16(v),
                ScalarValue::I32(v) => buf.$put_i32(v),
                ScalarValue::U32(v) => buf.$put_u32(v),
                ScalarValue::I64(v) => buf.$put_i64(v),
                ScalarValue::U64(v) => buf.$put_u64(v),
                ScalarValue::F32(v) => buf.$put_f32(v),
                ScalarValue::F64(v) => buf.$put_f64(v),
            }
        }

        /// NB: The caller must ensure that the buffer holds at least `scalar.size()` bytes
        pub fn $get(scalar: Scalar, buf: &mut impl Buf) -> ScalarValue {
            match scalar {
                Scalar::I8 => ScalarValue::I8(buf.get_i8()),
                Scalar::U8 => ScalarValue::U8(buf.get_u8()),
                Scalar::I16 => ScalarValue::I16(buf.$get_i16()),
                Scalar::U16 => ScalarValue::U16(buf.$get_u16()),
                Scalar::I32 => ScalarValue::I32(buf.$get_i32()),
                Scalar::U32 => ScalarValue::U32(buf.$get_u32()),
                Scalar::I64 => ScalarValue::I64(buf.$get_i64()),
                Scalar::U64 => ScalarValue::U64(buf.$get_u64()),
                Scalar::F32 => ScalarValue::F32(buf.$get_f32()),
                Scalar::F64 => ScalarValue::F64(buf.$get_f64()),
            }
        }
    }
}

impl ScalarValue {
    pub fn scalar(&self) -> Scalar {
        match self {
            ScalarValue::I8(_) => Scalar::I8,
            ScalarValue::U8(_) => Scalar::U8,
            ScalarValue::I16(_) => Scalar::I16,
            ScalarValue::U16(_) => Scalar::U16,
            ScalarValue::I32(_) => Scalar::I32,
            ScalarValue::U32(_) => Scalar::U32,
            ScalarValue::I64(_) => Scalar::I64,
            ScalarValue::U64(_) => Scalar::U64,
            ScalarValue::F32(_) => Scalar::F32,
            ScalarValue::F64(_) => Scalar::F64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::I8(v) => v as f64,
            ScalarValue::U8(v) => v as f64,
            ScalarValue::I16(v) => v as f64,
            ScalarValue::U16(v) => v as f64,
            ScalarValue::I32(v) => v as f64,
            ScalarValue::U32(v) => v as f64,
            ScalarValue::I64(v) => v as f64,
            ScalarValue::U64(v) => v as f64,
            ScalarValue::F32(v) => v as f64,
            ScalarValue::F64(v) => v,
        }
    }

    // network byte order
    scalar_codec!(put_be, get_be,
        put_i16, put_u16, put_i32, put_u32, put_i64, put_u64, put_f32, put_f64,
        get_i16, get_u16, get_i32, get_u32, get_i64, get_u64, get_f32, get_f64);

    // host byte order, for packed in-memory storage
    scalar_codec!(put_ne, get_ne,
        put_i16_ne, put_u16_ne, put_i32_ne, put_u32_ne, put_i64_ne, put_u64_ne, put_f32_ne, put_f64_ne,
        get_i16_ne, get_u16_ne, get_i32_ne, get_u32_ne, get_i64_ne, get_u64_ne, get_f32_ne, get_f64_ne);
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AtomicValue {
    Real(ScalarValue),
    Complex(ScalarValue, ScalarValue),
}

impl AtomicValue {
    /// NB: For a complex value, both parts must have the same scalar type
    pub fn atomic_type(&self) -> AtomicType {
        match self {
            AtomicValue::Real(v) => AtomicType::real(v.scalar()),
            AtomicValue::Complex(re, _) => AtomicType::complex(re.scalar()),
        }
    }

    pub fn is_consistent(&self) -> bool {
        match self {
            AtomicValue::Real(_) => true,
            AtomicValue::Complex(re, im) => re.scalar() == im.scalar(),
        }
    }

    pub fn put_be(&self, buf: &mut impl BufMut) {
        match self {
            AtomicValue::Real(v) => v.put_be(buf),
            AtomicValue::Complex(re, im) => {
                re.put_be(buf);
                im.put_be(buf);
            }
        }
    }

    pub fn get_be(ty: AtomicType, buf: &mut impl Buf) -> AtomicValue {
        if ty.complex {
            let re = ScalarValue::get_be(ty.scalar, buf);
            let im = ScalarValue::get_be(ty.scalar, buf);
            AtomicValue::Complex(re, im)
        }
        else {
            AtomicValue::Real(ScalarValue::get_be(ty.scalar, buf))
        }
    }

    pub fn put_ne(&self, buf: &mut impl BufMut) {
        match self {
            AtomicValue::Real(v) => v.put_ne(buf),
            AtomicValue::Complex(re, im) => {
                re.put_ne(buf);
                im.put_ne(buf);
            }
        }
    }

    pub fn get_ne(ty: AtomicType, buf: &mut impl Buf) -> AtomicValue {
        if ty.complex {
            let re = ScalarValue::get_ne(ty.scalar, buf);
            let im = ScalarValue::get_ne(ty.scalar, buf);
            AtomicValue::Complex(re, im)
        }
        else {
            AtomicValue::Real(ScalarValue::get_ne(ty.scalar, buf))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::byte(TypeCode::Byte, 1)]
    #[case::ubyte(TypeCode::UByte, 1)]
    #[case::short(TypeCode::Short, 2)]
    #[case::int(TypeCode::Int, 4)]
    #[case::long(TypeCode::Long, 8)]
    #[case::float(TypeCode::Float, 4)]
    #[case::double(TypeCode::Double, 8)]
    #[case::complex(TypeCode::Complex, 8)]
    #[case::dcomplex(TypeCode::DComplex, 16)]
    #[case::bcomplex(TypeCode::BComplex, 2)]
    #[case::ulcomplex(TypeCode::ULComplex, 16)]
    fn test_atomic_type_code(#[case] code: TypeCode, #[case] size: usize) {
        let ty = AtomicType::from_type_code(code).unwrap();
        assert_eq!(ty.size(), size);
        assert_eq!(ty.type_code(), code);
    }

    #[rstest]
    #[case::none(TypeCode::None)]
    #[case::array(TypeCode::Array)]
    #[case::list(TypeCode::List)]
    #[case::multi_array(TypeCode::MultiArray)]
    #[case::vstring(TypeCode::VString)]
    #[case::fstring(TypeCode::FString)]
    fn test_non_atomic_type_code(#[case] code: TypeCode) {
        assert!(AtomicType::from_type_code(code).is_none());
    }

    #[test]
    fn test_type_code_from_wire() {
        assert_eq!(TypeCode::try_from(25u32).unwrap(), TypeCode::FString);
        assert!(TypeCode::try_from(26u32).is_err());
        assert_eq!(u32::from(TypeCode::DComplex), 10);
    }

    #[rstest]
    #[case::i16(ScalarValue::I16(-2), vec![0xff, 0xfe])]
    #[case::u32(ScalarValue::U32(0x0102_0304), vec![1, 2, 3, 4])]
    #[case::f64(ScalarValue::F64(1.0), vec![0x3f, 0xf0, 0, 0, 0, 0, 0, 0])]
    fn test_scalar_be(#[case] value: ScalarValue, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        value.put_be(&mut buf);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(ScalarValue::get_be(value.scalar(), &mut b), value);
        assert!(b.is_empty());
    }

    #[test]
    fn test_complex_real_part_first() {
        let value = AtomicValue::Complex(ScalarValue::I16(1), ScalarValue::I16(2));
        assert_eq!(value.atomic_type(), AtomicType::complex(Scalar::I16));

        let mut buf = Vec::new();
        value.put_be(&mut buf);
        assert_eq!(buf, vec![0, 1, 0, 2]);

        let mut b: &[u8] = &buf;
        assert_eq!(AtomicValue::get_be(AtomicType::complex(Scalar::I16), &mut b), value);
    }

    #[test]
    fn test_inconsistent_complex() {
        assert!(!AtomicValue::Complex(ScalarValue::I16(1), ScalarValue::F32(2.0)).is_consistent());
        assert!(AtomicValue::Real(ScalarValue::U8(1)).is_consistent());
    }
}
