pub mod ask;
pub mod init;
pub mod serve;
pub mod status;
