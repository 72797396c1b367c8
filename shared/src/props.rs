//! Player property ids, status bits and position helpers

pub const PLPROP_NICKNAME: u8 = 0;
pub const PLPROP_MAXPOWER: u8 = 1;
pub const PLPROP_CURPOWER: u8 = 2;
pub const PLPROP_RUPEESCOUNT: u8 = 3;
pub const PLPROP_ARROWSCOUNT: u8 = 4;
pub const PLPROP_BOMBSCOUNT: u8 = 5;
pub const PLPROP_GLOVEPOWER: u8 = 6;
pub const PLPROP_BOMBPOWER: u8 = 7;
pub const PLPROP_SWORDPOWER: u8 = 8;
pub const PLPROP_SHIELDPOWER: u8 = 9;
pub const PLPROP_GANI: u8 = 10;
pub const PLPROP_HEADGIF: u8 = 11;
pub const PLPROP_CURCHAT: u8 = 12;
pub const PLPROP_COLORS: u8 = 13;
pub const PLPROP_ID: u8 = 14;
pub const PLPROP_X: u8 = 15;
pub const PLPROP_Y: u8 = 16;
pub const PLPROP_SPRITE: u8 = 17;
pub const PLPROP_STATUS: u8 = 18;
pub const PLPROP_CARRYSPRITE: u8 = 19;
pub const PLPROP_CURLEVEL: u8 = 20;
pub const PLPROP_HORSEGIF: u8 = 21;
pub const PLPROP_HORSEBUSHES: u8 = 22;
pub const PLPROP_EFFECTCOLORS: u8 = 23;
pub const PLPROP_CARRYNPC: u8 = 24;
pub const PLPROP_APCOUNTER: u8 = 25;
pub const PLPROP_MAGICPOINTS: u8 = 26;
pub const PLPROP_KILLSCOUNT: u8 = 27;
pub const PLPROP_DEATHSCOUNT: u8 = 28;
pub const PLPROP_ONLINESECS: u8 = 29;
pub const PLPROP_IPADDR: u8 = 30;
pub const PLPROP_UDPPORT: u8 = 31;
pub const PLPROP_ALIGNMENT: u8 = 32;
pub const PLPROP_ADDITFLAGS: u8 = 33;
pub const PLPROP_ACCOUNTNAME: u8 = 34;
pub const PLPROP_BODYIMG: u8 = 35;
pub const PLPROP_RATING: u8 = 36;
pub const PLPROP_GATTRIB1: u8 = 37;
pub const PLPROP_ATTACHNPC: u8 = 42;
pub const PLPROP_GMAPLEVELX: u8 = 43;
pub const PLPROP_GMAPLEVELY: u8 = 44;
pub const PLPROP_Z: u8 = 45;
pub const PLPROP_GATTRIB6: u8 = 46;
pub const PLPROP_JOINLEAVELVL: u8 = 50;
pub const PLPROP_PCONNECTED: u8 = 51;
pub const PLPROP_PLANGUAGE: u8 = 52;
pub const PLPROP_PSTATUSMSG: u8 = 53;
pub const PLPROP_GATTRIB10: u8 = 54;
pub const PLPROP_OSTYPE: u8 = 75;
pub const PLPROP_TEXTCODEPAGE: u8 = 76;
pub const PLPROP_UNKNOWN77: u8 = 77;
pub const PLPROP_X2: u8 = 78;
pub const PLPROP_Y2: u8 = 79;
pub const PLPROP_Z2: u8 = 80;
pub const PLPROP_UNKNOWN81: u8 = 81;
pub const PLPROP_COMMUNITYNAME: u8 = 82;

/// Number of property ids
pub const PROPS_COUNT: usize = 83;

/// Pre-2.1 clients only understand the first 37 ids
pub const LEGACY_PROPS_COUNT: usize = 37;

/// Property ids of the thirty generic attribute slots, in slot order
pub const ATTRIBUTE_PROPS: [u8; 30] = [
    37, 38, 39, 40, 41, 46, 47, 48, 49, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63, 64, 65, 66, 67, 68,
    69, 70, 71, 72, 73, 74,
];

/// Maps an attribute property id to its slot index
pub fn attribute_slot(prop: u8) -> Option<usize> {
    ATTRIBUTE_PROPS.iter().position(|&p| p == prop)
}

// PLPROP_STATUS bits
pub const PLSTATUS_PAUSED: u8 = 0x01;
pub const PLSTATUS_HIDDEN: u8 = 0x02;
pub const PLSTATUS_MALE: u8 = 0x04;
pub const PLSTATUS_DEAD: u8 = 0x08;
pub const PLSTATUS_ALLOWWEAPONS: u8 = 0x10;
pub const PLSTATUS_HASSPIN: u8 = 0x40;

// PLPROP_ADDITFLAGS bits
pub const PLFLAG_NOMASSMESSAGE: u8 = 0x01;
pub const PLFLAG_NOTOALL: u8 = 0x04;

/// Encodes a signed pixel position as the wire short (sign in bit 0)
pub fn encode_precise(value: i32) -> u32 {
    let mut encoded = (value.unsigned_abs() << 1) & 0xFFFF;
    if value < 0 {
        encoded |= 1;
    }
    encoded
}

/// Inverse of [`encode_precise`]
pub fn decode_precise(raw: u16) -> i32 {
    let magnitude = i32::from(raw >> 1);
    if raw & 1 != 0 {
        -magnitude
    } else {
        magnitude
    }
}
