mod wallet;

pub use wallet::{RpcPolicy, XmrWallet};
