pub mod resolver;
pub mod rpc;

pub use resolver::{merge_mock_chains, resolve, ChainResolution, MockChains};
pub use rpc::{
    request_typed, Eip1193Provider, HttpConnector, HttpRpcClient, NetworkHandle, RpcConnector,
};
