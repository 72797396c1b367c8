//! Which player properties travel in which situation.
//!
//! Every table has one entry per property id. The tables are fixed at compile
//! time and shared by reference through [`VISIBILITY`].

use shared::props::PROPS_COUNT;

pub type PropTable = [bool; PROPS_COUNT];

pub struct Visibility {
    /// Own props a session receives after login
    pub send_on_login: PropTable,
    /// Props other clients see when a player appears
    pub get_login: PropTable,
    /// Like `get_login`, for NC sessions (no profile fields)
    pub get_login_nc: PropTable,
    /// Props forwarded to the level when they change
    pub send_on_local_change: PropTable,
    /// Props RC sessions see when a player appears
    pub get_rc_login: PropTable,
}

const fn table(bits: [u8; PROPS_COUNT]) -> PropTable {
    let mut out = [false; PROPS_COUNT];
    let mut i = 0;
    while i < PROPS_COUNT {
        out[i] = bits[i] != 0;
        i += 1;
    }
    out
}

#[rustfmt::skip]
pub static VISIBILITY: Visibility = Visibility {
    send_on_login: table([
        0, 1, 1, 1, 1, 1,   // 0-5
        1, 0, 1, 1, 1, 1,   // 6-11
        0, 1, 0, 0, 0, 1,   // 12-17
        1, 0, 0, 1, 1, 1,   // 18-23
        0, 1, 1, 0, 0, 0,   // 24-29
        0, 0, 1, 0, 1, 1,   // 30-35
        1, 1, 1, 1, 1, 1,   // 36-41
        0, 0, 0, 0, 1, 1,   // 42-47
        1, 1, 0, 0, 0, 0,   // 48-53
        1, 1, 1, 1, 1, 1,   // 54-59
        1, 1, 1, 1, 1, 1,   // 60-65
        1, 1, 1, 1, 1, 1,   // 66-71
        1, 1, 1, 0, 0, 0,   // 72-77
        0, 0, 0, 0, 1,      // 78-82
    ]),
    get_login: table([
        1, 0, 0, 0, 0, 0,
        0, 0, 1, 1, 1, 1,
        1, 1, 0, 1, 1, 1,
        1, 1, 1, 1, 0, 0,
        1, 0, 0, 0, 0, 0,
        1, 1, 1, 0, 1, 1,
        1, 1, 1, 1, 1, 1,
        0, 1, 1, 1, 1, 1,
        1, 1, 1, 0, 0, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 0, 0, 0,
        1, 1, 1, 0, 1,
    ]),
    get_login_nc: table([
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 0, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        0, 1, 1, 1, 1, 1,
        1, 1, 1, 0, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 0, 0,
        1, 1, 1, 0, 0,
    ]),
    send_on_local_change: table([
        0, 0, 1, 0, 0, 0,
        0, 0, 1, 1, 1, 1,
        1, 1, 0, 1, 1, 1,
        1, 1, 1, 1, 0, 0,
        1, 1, 0, 0, 0, 0,
        1, 1, 1, 0, 1, 1,
        1, 1, 1, 1, 1, 1,
        0, 1, 1, 1, 1, 1,
        1, 1, 1, 0, 0, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 1, 1, 1,
        1, 1, 1, 0, 0, 0,
        1, 1, 1, 0, 1,
    ]),
    get_rc_login: table([
        1, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 1,
        0, 0, 0, 0, 0, 0,
        1, 0, 1, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
        1, 1, 0, 0, 1, 0,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 1,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 1,
    ]),
};
