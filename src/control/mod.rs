//! 控制接口：`download:*` 方法与事件推送，替代原桌面程序的 IPC 通道

pub mod handlers;
pub mod methods;
pub mod server;

pub use handlers::ControlHandler;
pub use server::ControlServer;
