#[macro_export]
macro_rules! tls_enum_u8 {
	($name:ident => { $( $case:ident ( $val:expr ) ),* , (255) }) => {
		#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
		#[allow(non_camel_case_types)]
		pub enum $name {
			$(
				$case,
			)*
			unknown(u8)
		}

		impl $name {
			pub fn to_u8(&self) -> u8 {
				match self {
					$(
						$name::$case => $val,
					)*
					$name::unknown(v) => *v
				}
			}

			pub fn from_u8(v: u8) -> Self {
				match v {
					$(
						$val => $name::$case,
					)*
					_ => $name::unknown(v)
				}
			}

			pub fn parse(input: &mut $crate::parsing::ByteReader) -> $crate::error::Result<Self> {
				Ok(Self::from_u8(input.next_u8()?))
			}

			pub fn serialize(&self, out: &mut Vec<u8>) {
				out.push(self.to_u8());
			}
		}
	};
}

/// Like tls_enum_u8! but for 16-bit registry values which must round-trip
/// unknown code points.
#[macro_export]
macro_rules! tls_enum_u16 {
	($(#[$meta:meta])* $name:ident => { $( $case:ident = $val:expr ),* $(,)? }) => {
		$(#[$meta])*
		#[derive(Clone, Copy, Debug)]
		pub enum $name {
			$(
				$case,
			)*
			Unknown(u16)
		}

		impl $name {
			pub fn from_value(v: u16) -> Self {
				match v {
					$(
						$val => $name::$case,
					)*
					_ => $name::Unknown(v)
				}
			}

			pub fn to_value(&self) -> u16 {
				match self {
					$(
						$name::$case => $val,
					)*
					$name::Unknown(v) => *v
				}
			}

			pub fn parse(input: &mut $crate::parsing::ByteReader) -> $crate::error::Result<Self> {
				Ok(Self::from_value(input.next_u16()?))
			}

			pub fn serialize(&self, out: &mut Vec<u8>) {
				out.extend_from_slice(&self.to_value().to_be_bytes());
			}
		}

		impl ::std::cmp::PartialEq for $name {
			fn eq(&self, other: &Self) -> bool {
				self.to_value() == other.to_value()
			}
		}

		impl ::std::cmp::Eq for $name {}

		impl ::std::hash::Hash for $name {
			fn hash<H: ::std::hash::Hasher>(&self, state: &mut H) {
				self.to_value().hash(state);
			}
		}
	};
}

#[macro_export]
macro_rules! tls_struct {
	($name:ident => { $( $typ:ident $field:ident );* ; }) => {
		#[derive(Debug, Clone)]
		pub struct $name {
			$(
				pub $field: $typ,
			)*
		}

		impl $name {
			pub fn parse(input: &mut $crate::parsing::ByteReader) -> $crate::error::Result<Self> {
				$(
					let $field = $typ::parse(input)?;
				)*

				Ok(Self { $( $field, )* })
			}

			pub fn serialize(&self, out: &mut Vec<u8>) {
				$(
					self.$field.serialize(out);
				)*
			}
		}
	};
}
