// test-support: shared test utilities for sessiond's integration suite.
//
// Provides a generic WebSocket mock client for exercising the local
// dashboard hub, and a mock cloud-relay server for exercising the remote
// tunnel client's handshake and reconnect behavior.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockRelayServer;
