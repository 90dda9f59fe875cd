pub const DEFAULT_PUBLISHER: &str = "com.ongres";
pub const DEFAULT_REPOSITORY: &str = "https://extensions.stackgres.io/postgres/repository";
pub const DEFAULT_LABEL_PREFIX: &str = "stackgres.io/";

pub fn default_instances() -> i32 {
    1
}

pub fn default_postgres_version() -> String {
    "16".to_owned()
}

pub fn default_publisher() -> String {
    DEFAULT_PUBLISHER.to_owned()
}

pub fn default_repository() -> String {
    DEFAULT_REPOSITORY.to_owned()
}

pub fn default_port() -> i32 {
    5432
}

pub fn default_patroni_image(postgres_version: &str) -> String {
    format!("quay.io/ongres/patroni:v3.2.2-pg{postgres_version}")
}

pub fn default_true() -> bool {
    true
}
