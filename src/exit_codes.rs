/// Process exit codes shared by both front ends.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    /// 128 + SIGINT, as shells report an interrupted command.
    pub const INTERRUPTED: i32 = 130;
}
