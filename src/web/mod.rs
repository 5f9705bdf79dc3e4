pub mod rest_client;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod ws_client;
