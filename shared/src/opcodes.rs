//! Packet identifiers. On the wire every id is written as a GChar (+32).

// Client to server
pub const PLI_LEVELWARP: u8 = 0;
pub const PLI_BOARDMODIFY: u8 = 1;
pub const PLI_PLAYERPROPS: u8 = 2;
pub const PLI_NPCPROPS: u8 = 3;
pub const PLI_BOMBADD: u8 = 4;
pub const PLI_BOMBDEL: u8 = 5;
pub const PLI_TOALL: u8 = 6;
pub const PLI_HORSEADD: u8 = 7;
pub const PLI_HORSEDEL: u8 = 8;
pub const PLI_ARROWADD: u8 = 9;
pub const PLI_FIRESPY: u8 = 10;
pub const PLI_THROWCARRIED: u8 = 11;
pub const PLI_ITEMADD: u8 = 12;
pub const PLI_ITEMDEL: u8 = 13;
pub const PLI_CLAIMPKER: u8 = 14;
pub const PLI_BADDYPROPS: u8 = 15;
pub const PLI_BADDYHURT: u8 = 16;
pub const PLI_BADDYADD: u8 = 17;
pub const PLI_FLAGSET: u8 = 18;
pub const PLI_FLAGDEL: u8 = 19;
pub const PLI_OPENCHEST: u8 = 20;
pub const PLI_PUTNPC: u8 = 21;
pub const PLI_NPCDEL: u8 = 22;
pub const PLI_WANTFILE: u8 = 23;
pub const PLI_SHOWIMG: u8 = 24;
pub const PLI_HURTPLAYER: u8 = 26;
pub const PLI_EXPLOSION: u8 = 27;
pub const PLI_PRIVATEMESSAGE: u8 = 28;
pub const PLI_NPCWEAPONDEL: u8 = 29;
pub const PLI_LEVELWARPMOD: u8 = 30;
pub const PLI_PACKETCOUNT: u8 = 31;
pub const PLI_ITEMTAKE: u8 = 32;
pub const PLI_WEAPONADD: u8 = 33;
pub const PLI_UPDATEFILE: u8 = 34;
pub const PLI_ADJACENTLEVEL: u8 = 35;
pub const PLI_HITOBJECTS: u8 = 36;
pub const PLI_LANGUAGE: u8 = 37;
pub const PLI_TRIGGERACTION: u8 = 38;
pub const PLI_MAPINFO: u8 = 39;
pub const PLI_SHOOT: u8 = 40;
pub const PLI_SERVERWARP: u8 = 41;
pub const PLI_PROCESSLIST: u8 = 44;
pub const PLI_UNKNOWN46: u8 = 46;
pub const PLI_UNKNOWN47: u8 = 47;
pub const PLI_UPDATECLASS: u8 = 48;
pub const PLI_RAWDATA: u8 = 50;
pub const PLI_PROFILEGET: u8 = 98;
pub const PLI_PROFILESET: u8 = 99;
pub const PLI_REQUESTTEXT: u8 = 152;
pub const PLI_SENDTEXT: u8 = 154;
pub const PLI_UNKNOWN157: u8 = 157;
pub const PLI_UPDATESCRIPT: u8 = 158;

// Server to client
pub const PLO_LEVELBOARD: u8 = 0;
pub const PLO_LEVELLINK: u8 = 1;
pub const PLO_BADDYPROPS: u8 = 2;
pub const PLO_NPCPROPS: u8 = 3;
pub const PLO_LEVELCHEST: u8 = 4;
pub const PLO_LEVELSIGN: u8 = 5;
pub const PLO_LEVELNAME: u8 = 6;
pub const PLO_BOARDMODIFY: u8 = 7;
pub const PLO_OTHERPLPROPS: u8 = 8;
pub const PLO_PLAYERPROPS: u8 = 9;
pub const PLO_ISLEADER: u8 = 10;
pub const PLO_BOMBADD: u8 = 11;
pub const PLO_BOMBDEL: u8 = 12;
pub const PLO_TOALL: u8 = 13;
pub const PLO_PLAYERWARP: u8 = 14;
pub const PLO_WARPFAILED: u8 = 15;
pub const PLO_DISCMESSAGE: u8 = 16;
pub const PLO_HORSEADD: u8 = 17;
pub const PLO_HORSEDEL: u8 = 18;
pub const PLO_ARROWADD: u8 = 19;
pub const PLO_FIRESPY: u8 = 20;
pub const PLO_THROWCARRIED: u8 = 21;
pub const PLO_ITEMADD: u8 = 22;
pub const PLO_ITEMDEL: u8 = 23;
pub const PLO_NPCMOVED: u8 = 24;
pub const PLO_SIGNATURE: u8 = 25;
pub const PLO_BADDYHURT: u8 = 27;
pub const PLO_FLAGSET: u8 = 28;
pub const PLO_NPCDEL: u8 = 29;
pub const PLO_FILESENDFAILED: u8 = 30;
pub const PLO_FLAGDEL: u8 = 31;
pub const PLO_SHOWIMG: u8 = 32;
pub const PLO_NPCWEAPONADD: u8 = 33;
pub const PLO_NPCWEAPONDEL: u8 = 34;
pub const PLO_RC_ADMINMESSAGE: u8 = 35;
pub const PLO_EXPLOSION: u8 = 36;
pub const PLO_PRIVATEMESSAGE: u8 = 37;
pub const PLO_PUSHAWAY: u8 = 38;
pub const PLO_LEVELMODTIME: u8 = 39;
pub const PLO_HURTPLAYER: u8 = 40;
pub const PLO_STARTMESSAGE: u8 = 41;
pub const PLO_NEWWORLDTIME: u8 = 42;
pub const PLO_DEFAULTWEAPON: u8 = 43;
pub const PLO_FILEUPTODATE: u8 = 45;
pub const PLO_HITOBJECTS: u8 = 46;
pub const PLO_TRIGGERACTION: u8 = 48;
pub const PLO_PLAYERWARP2: u8 = 49;
pub const PLO_ADDPLAYER: u8 = 55;
pub const PLO_DELPLAYER: u8 = 56;
pub const PLO_LARGEFILESTART: u8 = 68;
pub const PLO_LARGEFILEEND: u8 = 69;
pub const PLO_RC_CHAT: u8 = 74;
pub const PLO_LARGEFILESIZE: u8 = 84;
pub const PLO_RAWDATA: u8 = 100;
pub const PLO_BOARDPACKET: u8 = 101;
pub const PLO_FILE: u8 = 102;
pub const PLO_NPCDEL2: u8 = 150;
pub const PLO_SAY2: u8 = 153;
pub const PLO_SETACTIVELEVEL: u8 = 156;
pub const PLO_GHOSTICON: u8 = 174;
pub const PLO_SHOOT: u8 = 175;
pub const PLO_UNKNOWN195: u8 = 195;

// Server to list server
pub const SVO_VERIACC2: u8 = 17;
pub const SVO_SERVERINFO: u8 = 20;
