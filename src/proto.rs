//! Wire protocol enumerations shared by the query builder and the codec.
//!
//! The numeric codes are fixed by the server's protocol schema; the driver
//! never invents codes outside these enumerations.

/// Magic number opening the V1_0 handshake, written little-endian.
pub const HANDSHAKE_MAGIC: u32 = 0x34c2_bdc3;

/// Sub-protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: u64 = 0;

/// Query envelope types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
  Start = 1,
  Continue = 2,
  Stop = 3,
  NoreplyWait = 4,
  ServerInfo = 5,
}

/// Response envelope types (the `t` field).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
  SuccessAtom = 1,
  SuccessSequence = 2,
  SuccessPartial = 3,
  WaitComplete = 4,
  ServerInfo = 5,
  ClientError = 16,
  CompileError = 17,
  RuntimeError = 18,
}

impl TryFrom<u8> for ResponseType {
  type Error = u8;
  fn try_from(v: u8) -> Result<Self, u8> {
    match v {
      1 => Ok(Self::SuccessAtom),
      2 => Ok(Self::SuccessSequence),
      3 => Ok(Self::SuccessPartial),
      4 => Ok(Self::WaitComplete),
      5 => Ok(Self::ServerInfo),
      16 => Ok(Self::ClientError),
      17 => Ok(Self::CompileError),
      18 => Ok(Self::RuntimeError),
      other => Err(other),
    }
  }
}

/// Runtime error kinds (the `e` field on RUNTIME_ERROR responses).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
  Internal = 1_000_000,
  ResourceLimit = 2_000_000,
  QueryLogic = 3_000_000,
  NonExistence = 3_100_000,
  OpFailed = 4_100_000,
  OpIndeterminate = 4_200_000,
  User = 5_000_000,
  PermissionError = 6_000_000,
}

impl TryFrom<u32> for ErrorType {
  type Error = u32;
  fn try_from(v: u32) -> Result<Self, u32> {
    match v {
      1_000_000 => Ok(Self::Internal),
      2_000_000 => Ok(Self::ResourceLimit),
      3_000_000 => Ok(Self::QueryLogic),
      3_100_000 => Ok(Self::NonExistence),
      4_100_000 => Ok(Self::OpFailed),
      4_200_000 => Ok(Self::OpIndeterminate),
      5_000_000 => Ok(Self::User),
      6_000_000 => Ok(Self::PermissionError),
      other => Err(other),
    }
  }
}

/// Stream annotations (the `n` field): which kind of feed a partial
/// sequence belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseNote {
  SequenceFeed = 1,
  AtomFeed = 2,
  OrderByLimitFeed = 3,
  UnionedFeed = 4,
  IncludesStates = 5,
}

impl ResponseNote {
  /// Whether this note marks the sequence as a changefeed.
  pub fn is_feed(self) -> bool {
    !matches!(self, Self::IncludesStates)
  }
}

impl TryFrom<u8> for ResponseNote {
  type Error = u8;
  fn try_from(v: u8) -> Result<Self, u8> {
    match v {
      1 => Ok(Self::SequenceFeed),
      2 => Ok(Self::AtomFeed),
      3 => Ok(Self::OrderByLimitFeed),
      4 => Ok(Self::UnionedFeed),
      5 => Ok(Self::IncludesStates),
      other => Err(other),
    }
  }
}

macro_rules! term_types {
  ($($name:ident = $code:literal,)*) => {
    /// Operator codes for every term the protocol understands.
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum TermType {
      $($name = $code,)*
    }

    impl TryFrom<u32> for TermType {
      type Error = u32;
      fn try_from(v: u32) -> Result<Self, u32> {
        match v {
          $($code => Ok(Self::$name),)*
          other => Err(other),
        }
      }
    }
  };
}

term_types! {
  Datum = 1,
  MakeArray = 2,
  MakeObj = 3,
  Var = 10,
  JavaScript = 11,
  Error = 12,
  ImplicitVar = 13,
  Db = 14,
  Table = 15,
  Get = 16,
  Eq = 17,
  Ne = 18,
  Lt = 19,
  Le = 20,
  Gt = 21,
  Ge = 22,
  Not = 23,
  Add = 24,
  Sub = 25,
  Mul = 26,
  Div = 27,
  Mod = 28,
  Append = 29,
  Slice = 30,
  GetField = 31,
  HasFields = 32,
  Pluck = 33,
  Without = 34,
  Merge = 35,
  Reduce = 37,
  Map = 38,
  Filter = 39,
  ConcatMap = 40,
  OrderBy = 41,
  Distinct = 42,
  Count = 43,
  Union = 44,
  Nth = 45,
  InnerJoin = 48,
  OuterJoin = 49,
  EqJoin = 50,
  CoerceTo = 51,
  TypeOf = 52,
  Update = 53,
  Delete = 54,
  Replace = 55,
  Insert = 56,
  DbCreate = 57,
  DbDrop = 58,
  DbList = 59,
  TableCreate = 60,
  TableDrop = 61,
  TableList = 62,
  Funcall = 64,
  Branch = 65,
  Or = 66,
  And = 67,
  ForEach = 68,
  Func = 69,
  Skip = 70,
  Limit = 71,
  Zip = 72,
  Asc = 73,
  Desc = 74,
  IndexCreate = 75,
  IndexDrop = 76,
  IndexList = 77,
  GetAll = 78,
  Info = 79,
  Prepend = 80,
  Sample = 81,
  InsertAt = 82,
  DeleteAt = 83,
  ChangeAt = 84,
  SpliceAt = 85,
  IsEmpty = 86,
  OffsetsOf = 87,
  SetInsert = 88,
  SetIntersection = 89,
  SetUnion = 90,
  SetDifference = 91,
  Default = 92,
  Contains = 93,
  Keys = 94,
  Difference = 95,
  WithFields = 96,
  Match = 97,
  Json = 98,
  Iso8601 = 99,
  ToIso8601 = 100,
  EpochTime = 101,
  ToEpochTime = 102,
  Now = 103,
  InTimezone = 104,
  During = 105,
  Date = 106,
  Monday = 107,
  Tuesday = 108,
  Wednesday = 109,
  Thursday = 110,
  Friday = 111,
  Saturday = 112,
  Sunday = 113,
  January = 114,
  February = 115,
  March = 116,
  April = 117,
  May = 118,
  June = 119,
  July = 120,
  August = 121,
  September = 122,
  October = 123,
  November = 124,
  December = 125,
  TimeOfDay = 126,
  Timezone = 127,
  Year = 128,
  Month = 129,
  Day = 130,
  DayOfWeek = 131,
  DayOfYear = 132,
  Hours = 133,
  Minutes = 134,
  Seconds = 135,
  Time = 136,
  Literal = 137,
  Sync = 138,
  IndexStatus = 139,
  IndexWait = 140,
  Upcase = 141,
  Downcase = 142,
  Object = 143,
  Group = 144,
  Sum = 145,
  Avg = 146,
  Min = 147,
  Max = 148,
  Split = 149,
  Ungroup = 150,
  Random = 151,
  Changes = 152,
  Http = 153,
  Args = 154,
  Binary = 155,
  IndexRename = 156,
  Uuid = 169,
  Bracket = 170,
  ToJsonString = 172,
  Range = 173,
  Config = 174,
  Status = 175,
  Reconfigure = 176,
  Wait = 177,
  Rebalance = 179,
  Minval = 180,
  Maxval = 181,
  Between = 182,
  Floor = 183,
  Ceil = 184,
  Round = 185,
  Values = 186,
  Fold = 187,
  Grant = 188,
  SetWriteHook = 189,
  GetWriteHook = 190,
  BitAnd = 191,
  BitOr = 192,
  BitXor = 193,
  BitNot = 194,
  BitSal = 195,
  BitSar = 196,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_response_type_conversion() {
    assert_eq!(ResponseType::try_from(1), Ok(ResponseType::SuccessAtom));
    assert_eq!(ResponseType::try_from(3), Ok(ResponseType::SuccessPartial));
    assert_eq!(ResponseType::try_from(18), Ok(ResponseType::RuntimeError));
    assert!(ResponseType::try_from(6).is_err());
  }

  #[test]
  fn test_error_type_conversion() {
    assert_eq!(ErrorType::try_from(3_100_000), Ok(ErrorType::NonExistence));
    assert_eq!(ErrorType::try_from(6_000_000), Ok(ErrorType::PermissionError));
    assert!(ErrorType::try_from(42).is_err());
  }

  #[test]
  fn test_term_type_codes_match_the_schema() {
    assert_eq!(TermType::MakeArray as u32, 2);
    assert_eq!(TermType::Add as u32, 24);
    assert_eq!(TermType::Map as u32, 38);
    assert_eq!(TermType::Func as u32, 69);
    assert_eq!(TermType::Changes as u32, 152);
    assert_eq!(TermType::try_from(24), Ok(TermType::Add));
    assert!(TermType::try_from(999).is_err());
  }

  #[test]
  fn test_magic_is_little_endian_on_the_wire() {
    assert_eq!(HANDSHAKE_MAGIC.to_le_bytes(), [0xc3, 0xbd, 0xc2, 0x34]);
  }
}
