mod config_view;
mod device_view;
mod event_view;
mod painter;

pub(crate) use self::config_view::ConfigView;
pub(crate) use self::event_view::EventView;
pub(crate) use self::painter::Painter;
