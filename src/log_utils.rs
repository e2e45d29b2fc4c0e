use std::fmt::{Display, Formatter};
use dynfmt::Format;
use log::{Level, Metadata, Record};


#[macro_export]
macro_rules! log_id {
    ($lvl:ident, $id_chain:expr, $msg:expr) => {
        $lvl!(std::concat!("[{}] ", $msg), $id_chain)
    };
    ($lvl:ident, $id_chain:expr, $fmt:expr, $($arg:tt)*) => {
        $lvl!(std::concat!("[{}] ", $fmt), $id_chain, $($arg)*)
    };
}


pub const CLIENT_ID_FMT: &str = "CLIENT={}";
pub const FLOW_ID_FMT: &str = "FLOW={}";


/// A single component of a log prefix, e.g. `CLIENT=42`
#[derive(Copy, Clone)]
pub struct IdItem<T: Copy + serde::ser::Serialize> {
    fmt: &'static str,
    id: T,
}

/// A chain of identifiers rendered as `CLIENT=1/FLOW=7`
#[derive(Clone)]
pub struct IdChain<T: Copy + serde::ser::Serialize> {
    list: Vec<IdItem<T>>,
}

impl<T: Copy + serde::ser::Serialize> IdItem<T> {
    pub fn new(fmt: &'static str, id: T) -> Self {
        Self { fmt, id }
    }
}

impl<T: Copy + serde::ser::Serialize> IdChain<T> {
    /// Make a chain for a nested entity, e.g. a flow of a connection
    pub fn extended(&self, new: IdItem<T>) -> Self {
        Self {
            list: self.list.iter().copied().chain(std::iter::once(new)).collect(),
        }
    }
}

impl<T: Copy + serde::ser::Serialize> From<IdItem<T>> for IdChain<T> {
    fn from(x: IdItem<T>) -> Self {
        Self { list: vec![x] }
    }
}

impl<T: Copy + serde::ser::Serialize> Display for IdItem<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let x = dynfmt::curly::SimpleCurlyFormat
            .format(self.fmt, &[self.id])
            .map_err(|_| std::fmt::Error)?;
        f.write_str(&x)
    }
}

impl<T: Copy + serde::ser::Serialize> Display for IdChain<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut items = self.list.iter();
        if let Some(first) = items.next() {
            write!(f, "{}", first)?;
        }
        items.try_for_each(|x| write!(f, "/{}", x))
    }
}


static STDOUT_LOGGER: StdoutLogger = StdoutLogger;

/// Get the logger printing records to stdout
pub fn make_stdout_logger() -> &'static dyn log::Log {
    &STDOUT_LOGGER
}

struct StdoutLogger;

impl log::Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "{} [{:?}] [{}] [{}] {}",
                chrono::Local::now().format("%T.%6f"),
                std::thread::current().id(),
                record.level(),
                record.target(),
                record.args(),
            );
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use crate::log_utils::{IdChain, IdItem, CLIENT_ID_FMT, FLOW_ID_FMT};

    #[test]
    fn chain_renders_all_items() {
        let chain = IdChain::from(IdItem::new(CLIENT_ID_FMT, 42_u64));
        assert_eq!("CLIENT=42", format!("{}", chain));

        let nested = chain.extended(IdItem::new(FLOW_ID_FMT, 73));
        assert_eq!("CLIENT=42/FLOW=73", format!("{}", nested));
        assert_eq!("CLIENT=42", format!("{}", chain));
    }
}
