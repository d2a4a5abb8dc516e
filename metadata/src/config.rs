use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "MONGO_URI", default = "mongodb://localhost:27017")]
    pub mongo_uri: String,

    #[envconfig(from = "MONGO_DB_NAME", default = "metadata_service")]
    pub mongo_db_name: String,

    /// Timeout in seconds for outbound collection requests.
    #[envconfig(from = "HTTP_TIMEOUT", default = "30")]
    pub http_timeout: u64,

    #[envconfig(from = "API_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "API_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_BOOTSTRAP_SERVERS", default = "kafka:9092")]
    pub bootstrap_servers: String,

    #[envconfig(from = "KAFKA_TOPIC", default = "metadata-tasks")]
    pub topic: String,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "metadata-workers")]
    pub consumer_group: String,

    #[envconfig(from = "KAFKA_DLQ_TOPIC", default = "metadata-tasks-dlq")]
    pub dlq_topic: String,

    /// Retry attempts before a transiently failing task goes to the DLQ.
    #[envconfig(from = "KAFKA_MAX_RETRIES", default = "3")]
    pub max_retries: u32,
}
