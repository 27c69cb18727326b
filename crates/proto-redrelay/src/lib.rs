pub mod replica;

pub use replica::sync_response::Code;

impl replica::SyncResponse {
    /// Frames at or above Code::Error report a problem rather than data.
    pub fn is_error(&self) -> bool {
        self.code >= Code::Error as i32
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str_name())
    }
}
