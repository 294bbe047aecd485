use crate::protocol::CommandKind;
use metriken::*;

pub static PERCENTILES: &[(&str, f64)] = &[
    ("p25", 25.0),
    ("p50", 50.0),
    ("p75", 75.0),
    ("p90", 90.0),
    ("p99", 99.0),
    ("p999", 99.9),
    ("p9999", 99.99),
];

#[metric(name = "get")]
pub static GET: Counter = Counter::new();

#[metric(name = "gets")]
pub static GETS: Counter = Counter::new();

#[metric(name = "set")]
pub static SET: Counter = Counter::new();

#[metric(name = "add")]
pub static ADD: Counter = Counter::new();

#[metric(name = "replace")]
pub static REPLACE: Counter = Counter::new();

#[metric(name = "append")]
pub static APPEND: Counter = Counter::new();

#[metric(name = "prepend")]
pub static PREPEND: Counter = Counter::new();

#[metric(name = "delete")]
pub static DELETE: Counter = Counter::new();

#[metric(name = "get_key_hit")]
pub static GET_KEY_HIT: Counter = Counter::new();

#[metric(name = "get_key_miss")]
pub static GET_KEY_MISS: Counter = Counter::new();

#[metric(name = "request_parse_ex")]
pub static REQUEST_PARSE_EX: Counter = Counter::new();

#[metric(name = "backend_request")]
pub static BACKEND_REQUEST: Counter = Counter::new();

#[metric(name = "backend_connect")]
pub static BACKEND_CONNECT: Counter = Counter::new();

#[metric(name = "backend_ex")]
pub static BACKEND_EX: Counter = Counter::new();

#[metric(name = "ru_utime")]
pub static RU_UTIME: Counter = Counter::new();

#[metric(name = "ru_stime")]
pub static RU_STIME: Counter = Counter::new();

#[metric(name = "ru_maxrss")]
pub static RU_MAXRSS: Gauge = Gauge::new();

#[metric(name = "ru_ixrss")]
pub static RU_IXRSS: Gauge = Gauge::new();

#[metric(name = "ru_idrss")]
pub static RU_IDRSS: Gauge = Gauge::new();

#[metric(name = "ru_isrss")]
pub static RU_ISRSS: Gauge = Gauge::new();

#[metric(name = "ru_minflt")]
pub static RU_MINFLT: Counter = Counter::new();

#[metric(name = "ru_majflt")]
pub static RU_MAJFLT: Counter = Counter::new();

#[metric(name = "ru_nswap")]
pub static RU_NSWAP: Counter = Counter::new();

#[metric(name = "ru_inblock")]
pub static RU_INBLOCK: Counter = Counter::new();

#[metric(name = "ru_oublock")]
pub static RU_OUBLOCK: Counter = Counter::new();

#[metric(name = "ru_msgsnd")]
pub static RU_MSGSND: Counter = Counter::new();

#[metric(name = "ru_msgrcv")]
pub static RU_MSGRCV: Counter = Counter::new();

#[metric(name = "ru_nsignals")]
pub static RU_NSIGNALS: Counter = Counter::new();

#[metric(name = "ru_nvcsw")]
pub static RU_NVCSW: Counter = Counter::new();

#[metric(name = "ru_nivcsw")]
pub static RU_NIVCSW: Counter = Counter::new();

/// Increments the request counter for one accepted command.
pub(crate) fn record_command(kind: CommandKind) {
    match kind {
        CommandKind::Get => GET.increment(),
        CommandKind::Gets => GETS.increment(),
        CommandKind::Set => SET.increment(),
        CommandKind::Add => ADD.increment(),
        CommandKind::Replace => REPLACE.increment(),
        CommandKind::Append => APPEND.increment(),
        CommandKind::Prepend => PREPEND.increment(),
        CommandKind::Delete => DELETE.increment(),
    };
}
