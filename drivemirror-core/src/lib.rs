mod client;

pub use client::{
    ApiErrorClass, ChangeItem, ChangePage, DriveClient, DriveError, FilePage, FilePatch,
    FileRecord,
};
