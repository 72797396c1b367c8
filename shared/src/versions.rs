//! Version codes sent in the login record and their ordered ids
//!
//! Ids are ordered so that handlers can compare them (`version >= CLVER_2_1`).
//! Unrecognised codes resolve to [`VERSION_UNKNOWN`].

use crate::roles::Role;

pub type VersionId = i32;

pub const VERSION_UNKNOWN: VersionId = -1;

pub const CLVER_1_41: VersionId = 0;
pub const CLVER_1_411: VersionId = 1;
pub const CLVER_2_1: VersionId = 2;
pub const CLVER_2_12: VersionId = 3;
pub const CLVER_2_13: VersionId = 4;
pub const CLVER_2_14: VersionId = 5;
pub const CLVER_2_15: VersionId = 6;
pub const CLVER_2_16: VersionId = 7;
pub const CLVER_2_17: VersionId = 8;
pub const CLVER_2_18: VersionId = 9;
pub const CLVER_2_19: VersionId = 10;
pub const CLVER_2_2: VersionId = 11;
pub const CLVER_2_21: VersionId = 12;
pub const CLVER_2_22: VersionId = 13;
pub const CLVER_2_3: VersionId = 14;
pub const CLVER_2_31: VersionId = 15;
pub const CLVER_3: VersionId = 16;
pub const CLVER_3_01: VersionId = 17;
pub const CLVER_4_0211: VersionId = 18;
pub const CLVER_5_07: VersionId = 19;
pub const CLVER_6_015: VersionId = 20;

pub const RCVER_1_010: VersionId = 0;
pub const RCVER_1_1: VersionId = 1;
pub const RCVER_2: VersionId = 2;

pub const NCVER_1_1: VersionId = 0;
pub const NCVER_2_1: VersionId = 1;

const CLIENT_VERSIONS: &[(&str, VersionId, &str)] = &[
    ("GNW01113", CLVER_1_41, "1.41"),
    ("GNW01012", CLVER_1_411, "1.41r1"),
    ("GNW13110", CLVER_2_1, "2.1"),
    ("GNW28015", CLVER_2_12, "2.12"),
    ("GNW16045", CLVER_2_13, "2.13"),
    ("GNW22061", CLVER_2_14, "2.14"),
    ("GNW10061", CLVER_2_15, "2.15"),
    ("GNW31101", CLVER_2_16, "2.16"),
    ("GNW14110", CLVER_2_17, "2.17"),
    ("GNW17110", CLVER_2_18, "2.18"),
    ("GNW09120", CLVER_2_19, "2.19"),
    ("GNW15021", CLVER_2_2, "2.2"),
    ("GNW19051", CLVER_2_21, "2.21"),
    ("G3D16053", CLVER_2_22, "2.22"),
    ("G3D14097", CLVER_2_3, "2.3"),
    ("G3D22067", CLVER_2_31, "2.31"),
    ("G3D26090", CLVER_3, "3"),
    ("G3D03014", CLVER_3_01, "3.01"),
    ("G3D28095", CLVER_4_0211, "4.0211"),
    ("G3D0311C", CLVER_5_07, "5.07"),
    ("G3D0511C", CLVER_6_015, "6.015"),
];

const RC_VERSIONS: &[(&str, VersionId, &str)] = &[
    ("GSERV023", RCVER_1_010, "RC 1.010"),
    ("GSERV024", RCVER_1_1, "RC 1.1"),
    ("GSERV025", RCVER_2, "RC 2"),
];

const NC_VERSIONS: &[(&str, VersionId, &str)] = &[
    ("NCL11012", NCVER_1_1, "NC 1.1"),
    ("NCL21075", NCVER_2_1, "NC 2.1"),
];

fn lookup(table: &[(&str, VersionId, &'static str)], code: &[u8]) -> Option<(VersionId, &'static str)> {
    table
        .iter()
        .find(|(c, _, _)| c.as_bytes() == code)
        .map(|&(_, id, name)| (id, name))
}

pub fn client_version_id(code: &[u8]) -> VersionId {
    lookup(CLIENT_VERSIONS, code).map_or(VERSION_UNKNOWN, |(id, _)| id)
}

pub fn rc_version_id(code: &[u8]) -> VersionId {
    lookup(RC_VERSIONS, code).map_or(VERSION_UNKNOWN, |(id, _)| id)
}

pub fn nc_version_id(code: &[u8]) -> VersionId {
    lookup(NC_VERSIONS, code).map_or(VERSION_UNKNOWN, |(id, _)| id)
}

/// Resolves a version code against the table for the role
pub fn version_id_for(role: Role, code: &[u8]) -> VersionId {
    if role.is_client() {
        client_version_id(code)
    } else if role.is_nc() {
        nc_version_id(code)
    } else if role.is_rc() {
        rc_version_id(code)
    } else {
        VERSION_UNKNOWN
    }
}

/// Human readable version for logs
pub fn version_name(role: Role, code: &[u8]) -> &'static str {
    let table = if role.is_client() {
        CLIENT_VERSIONS
    } else if role.is_nc() {
        NC_VERSIONS
    } else if role.is_rc() {
        RC_VERSIONS
    } else {
        return "unknown";
    };
    lookup(table, code).map_or("unknown", |(_, name)| name)
}
