pub mod points_transaction;
pub mod viewer_account;

pub use self::points_transaction::*;
pub use self::viewer_account::*;
