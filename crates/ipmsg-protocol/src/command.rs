//! Command set. Base IPMsg codes plus the messenger's extension codes.
//!
//! Codes travel in decimal in the fifth packet field. The set is closed:
//! an unknown code is a decode failure, never a catch-all variant.

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    EntryAnnounce,
    ExitAnnounce,
    EntryAck,
    Absence,
    SendMessage,
    MessageAck,
    GetFileData,
    ReleaseFiles,
    GetDirFiles,
    RecallMessage,
    Avatar,
    GetAvatar,
    Typing,
    StopTyping,
    RecallList,
}

impl Command {
    pub const ALL: [Command; 15] = [
        Command::EntryAnnounce,
        Command::ExitAnnounce,
        Command::EntryAck,
        Command::Absence,
        Command::SendMessage,
        Command::MessageAck,
        Command::GetFileData,
        Command::ReleaseFiles,
        Command::GetDirFiles,
        Command::RecallMessage,
        Command::Avatar,
        Command::GetAvatar,
        Command::Typing,
        Command::StopTyping,
        Command::RecallList,
    ];

    /// Integer code written on the wire.
    pub const fn code(self) -> i64 {
        match self {
            Command::EntryAnnounce => 0x01,
            Command::ExitAnnounce => 0x02,
            Command::EntryAck => 0x03,
            Command::Absence => 0x04,
            Command::SendMessage => 0x20,
            Command::MessageAck => 0x21,
            Command::GetFileData => 0x60,
            Command::ReleaseFiles => 0x61,
            Command::GetDirFiles => 0x62,
            // Extension range, outside the base IPMsg set
            Command::RecallMessage => 0x0001_0000,
            Command::Avatar => 0x0002_0000,
            Command::GetAvatar => 0x0003_0000,
            Command::Typing => 0x0004_0000,
            Command::StopTyping => 0x0005_0000,
            Command::RecallList => 0x0006_0000,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::EntryAnnounce => "BR_ENTRY",
            Command::ExitAnnounce => "BR_EXIT",
            Command::EntryAck => "ANSENTRY",
            Command::Absence => "BR_ABSENCE",
            Command::SendMessage => "SENDMSG",
            Command::MessageAck => "RECVMSG",
            Command::GetFileData => "GETFILEDATA",
            Command::ReleaseFiles => "RELEASEFILES",
            Command::GetDirFiles => "GETDIRFILES",
            Command::RecallMessage => "RECALLMSG",
            Command::Avatar => "AVATAR",
            Command::GetAvatar => "GETAVATAR",
            Command::Typing => "TYPING",
            Command::StopTyping => "STOPTYPING",
            Command::RecallList => "RECALLLIST",
        }
    }
}

impl TryFrom<i64> for Command {
    type Error = ProtocolError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(ProtocolError::InvalidCommand(code))
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
