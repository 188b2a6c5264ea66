use std::fmt;

pub const MIN_NUMBER: i16 = -8192;
pub const MAX_NUMBER: i16 = 8191;

const NUMBER_MASK: u16 = 0x3FFF;
const NUMBER_SIGN: u16 = 0x2000;
const TEXT_PREFIX: u16 = 0x4B00;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Number,
    Bracket,
    Power,
    UnitType,
    Order,
    OrderNote,
    Result,
    Coast,
    Phase,
    Command,
    Parameter,
    Press,
    Text,
    Province,
    Reserved,
    Unknown,
}

impl Category {
    pub fn of(code: u16) -> Self {
        match (code >> 8) as u8 {
            0x00..=0x3F => Category::Number,
            0x40 => Category::Bracket,
            0x41 => Category::Power,
            0x42 => Category::UnitType,
            0x43 => Category::Order,
            0x44 => Category::OrderNote,
            0x45 => Category::Result,
            0x46 => Category::Coast,
            0x47 => Category::Phase,
            0x48 => Category::Command,
            0x49 => Category::Parameter,
            0x4A => Category::Press,
            0x4B => Category::Text,
            0x50..=0x57 => Category::Province,
            0x58..=0x5F => Category::Reserved,
            _ => Category::Unknown,
        }
    }
}

/// A single protocol vocabulary item.
///
/// Numbers and text characters carry their value in the code itself and have
/// no three-letter name.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    code: u16,
    name: [u8; 3],
}

impl Token {
    pub const fn new(code: u16, name: &[u8; 3]) -> Self {
        Self { code, name: *name }
    }

    const fn from_name(code: u16, name: &str) -> Self {
        let bytes = name.as_bytes();
        assert!(bytes.len() == 3, "token names are three letters");
        Self {
            code,
            name: [bytes[0], bytes[1], bytes[2]],
        }
    }

    pub fn number(value: i16) -> Option<Self> {
        if !(MIN_NUMBER..=MAX_NUMBER).contains(&value) {
            return None;
        }
        Some(Self {
            code: (value as u16) & NUMBER_MASK,
            name: [0; 3],
        })
    }

    pub fn character(c: u8) -> Self {
        Self {
            code: TEXT_PREFIX | u16::from(c),
            name: [0; 3],
        }
    }

    /// Rebuilds a token from its code alone. Only numbers and text
    /// characters can be recovered this way.
    pub fn literal(code: u16) -> Option<Self> {
        match Category::of(code) {
            Category::Number | Category::Text => Some(Self { code, name: [0; 3] }),
            _ => None,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn category(&self) -> Category {
        Category::of(self.code)
    }

    pub fn name_bytes(&self) -> [u8; 3] {
        self.name
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name).unwrap_or("???")
    }

    pub fn is_reserved(&self) -> bool {
        self.category() == Category::Reserved
    }

    pub fn value(&self) -> Option<i16> {
        if self.category() != Category::Number {
            return None;
        }
        let raw = self.code & NUMBER_MASK;
        if raw & NUMBER_SIGN != 0 {
            Some((i32::from(raw) - 0x4000) as i16)
        } else {
            Some(raw as i16)
        }
    }

    pub fn as_char(&self) -> Option<u8> {
        (self.category() == Category::Text).then_some((self.code & 0xFF) as u8)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value() {
            return write!(f, "{}", value);
        }
        if let Some(c) = self.as_char() {
            return match c {
                b'\'' => write!(f, "''''"),
                _ => write!(f, "'{}'", c as char),
            };
        }
        match self.category() {
            Category::Bracket if self.code == BRA.code => write!(f, "("),
            Category::Bracket if self.code == KET.code => write!(f, ")"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:#06X} {})", self.code, self)
    }
}

macro_rules! tokens {
    ($table:ident; $($ident:ident = $code:expr),* $(,)?) => {
        $(pub const $ident: Token = Token::from_name($code, stringify!($ident));)*

        pub static $table: &[Token] = &[$($ident),*];
    };
}

tokens! { BASE_TOKENS;
    BRA = 0x4000, KET = 0x4001,

    AUS = 0x4100, ENG = 0x4101, FRA = 0x4102, GER = 0x4103,
    ITA = 0x4104, RUS = 0x4105, TUR = 0x4106,

    AMY = 0x4200, FLT = 0x4201,

    CTO = 0x4320, CVY = 0x4321, HLD = 0x4322, MTO = 0x4323, SUP = 0x4324,
    VIA = 0x4325, DSB = 0x4340, RTO = 0x4341, BLD = 0x4380, REM = 0x4381,
    WVE = 0x4382,

    MBV = 0x4400, BPR = 0x4401, CST = 0x4402, ESC = 0x4403, FAR = 0x4404,
    HSC = 0x4405, NAS = 0x4406, NMB = 0x4407, NMR = 0x4408, NRN = 0x4409,
    NRS = 0x440A, NSA = 0x440B, NSC = 0x440C, NSF = 0x440D, NSP = 0x440E,
    NST = 0x440F, NSU = 0x4410, NVR = 0x4411, NYU = 0x4412, YSC = 0x4413,

    SUC = 0x4500, BNC = 0x4501, CUT = 0x4502, DSR = 0x4503, FLD = 0x4504,
    NSO = 0x4505, RET = 0x4506,

    NCS = 0x4600, NEC = 0x4602, ECS = 0x4604, SEC = 0x4606, SCS = 0x4608,
    SWC = 0x460A, WCS = 0x460C, NWC = 0x460E,

    SPR = 0x4700, SUM = 0x4701, FAL = 0x4702, AUT = 0x4703, WIN = 0x4704,

    CCD = 0x4800, DRW = 0x4801, FRM = 0x4802, GOF = 0x4803, HLO = 0x4804,
    HST = 0x4805, HUH = 0x4806, IAM = 0x4807, LOD = 0x4808, MAP = 0x4809,
    MDF = 0x480A, MIS = 0x480B, NME = 0x480C, NOT = 0x480D, NOW = 0x480E,
    OBS = 0x480F, OFF = 0x4810, ORD = 0x4811, OUT = 0x4812, PRN = 0x4813,
    REJ = 0x4814, SCO = 0x4815, SLO = 0x4816, SND = 0x4817, SUB = 0x4818,
    SVE = 0x4819, THX = 0x481A, TME = 0x481B, YES = 0x481C, ADM = 0x481D,
    SMR = 0x481E,

    AOA = 0x4900, BTL = 0x4901, ERR = 0x4902, LVL = 0x4903, MRT = 0x4904,
    MTL = 0x4905, NPB = 0x4906, NPR = 0x4907, PDA = 0x4908, PTL = 0x4909,
    RTL = 0x490A, UNO = 0x490B, DSD = 0x490D,

    ALY = 0x4A00, AND = 0x4A01, BWX = 0x4A02, DMZ = 0x4A03, ELS = 0x4A04,
    EXP = 0x4A05, FWD = 0x4A06, FCT = 0x4A07, FOR = 0x4A08, HOW = 0x4A09,
    IDK = 0x4A0A, IFF = 0x4A0B, INS = 0x4A0C, OCC = 0x4A0E, ORR = 0x4A0F,
    PCE = 0x4A10, POB = 0x4A11, PRP = 0x4A13, QRY = 0x4A14, SCD = 0x4A15,
    SRY = 0x4A16, SUG = 0x4A17, THK = 0x4A18, THN = 0x4A19, TRY = 0x4A1A,
    VSS = 0x4A1C, WHT = 0x4A1D, WHY = 0x4A1E, XDO = 0x4A1F, XOY = 0x4A20,
    YDO = 0x4A21, CHO = 0x4A22, BCC = 0x4A23, UNT = 0x4A24,
}

// Provinces of the standard map, in the order of the default representation.
tokens! { STANDARD_PROVINCES;
    BOH = 0x5000, BUR = 0x5001, GAL = 0x5002, RUH = 0x5003, SIL = 0x5004,
    TYR = 0x5005, UKR = 0x5006,

    BUD = 0x5107, MOS = 0x5108, MUN = 0x5109, PAR = 0x510A, SER = 0x510B,
    VIE = 0x510C, WAR = 0x510D,

    ADR = 0x520E, AEG = 0x520F, BAL = 0x5210, BAR = 0x5211, BLA = 0x5212,
    EAS = 0x5213, ECH = 0x5214, GOB = 0x5215, GOL = 0x5216, HEL = 0x5217,
    ION = 0x5218, IRI = 0x5219, MAO = 0x521A, NAO = 0x521B, NTH = 0x521C,
    NWG = 0x521D, SKA = 0x521E, TYS = 0x521F, WES = 0x5220,

    ALB = 0x5421, APU = 0x5422, ARM = 0x5423, CLY = 0x5424, FIN = 0x5425,
    GAS = 0x5426, LVN = 0x5427, NAF = 0x5428, PIC = 0x5429, PIE = 0x542A,
    PRU = 0x542B, SYR = 0x542C, TUS = 0x542D, WAL = 0x542E, YOR = 0x542F,

    ANK = 0x5530, BEL = 0x5531, BER = 0x5532, BRE = 0x5533, CON = 0x5534,
    DEN = 0x5535, EDI = 0x5536, GRE = 0x5537, HOL = 0x5538, KIE = 0x5539,
    LON = 0x553A, LVP = 0x553B, MAR = 0x553C, NAP = 0x553D, NWY = 0x553E,
    POR = 0x553F, ROM = 0x5540, RUM = 0x5541, SEV = 0x5542, SMY = 0x5543,
    SWE = 0x5544, TRI = 0x5545, TUN = 0x5546, VEN = 0x5547,

    BUL = 0x5748, SPA = 0x5749, STP = 0x574A,
}
