pub mod connection;
pub mod host;
pub mod pool;

pub use self::connection::Connection;
pub use self::host::Host;
pub use self::pool::ConnectionPool;
