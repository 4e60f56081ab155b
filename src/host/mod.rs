pub mod bridge_tabs;
pub mod channel;
pub mod contract;
pub mod stdio;
