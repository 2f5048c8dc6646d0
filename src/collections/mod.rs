pub(crate) mod promise;

pub(crate) use promise::Completion;
