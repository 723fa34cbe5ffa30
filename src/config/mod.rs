mod settings;

pub use settings::{
    AutoListSettings, ChainSettings, IngestionSettings, PostgresSettings, PushSettings,
    Settings, SinkSettings, StorageBackend, StorageSettings, TelegramSettings,
};
