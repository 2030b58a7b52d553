mod dispatch;

pub use dispatch::MessageRouter;
