//! 全局共享服务（数据库）
//!
//! 所有 bench 共用一组共享服务，进程内只构造一次并注入每个 Bench

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::domain::DatabaseServerInfo;
use crate::infra::compose::{ComposeRuntime, ExecOptions, RuntimeError};

/// 共享数据库服务所在的 compose 服务名
pub const DATABASE_SERVICE: &str = "global-db";

/// 共享服务注册表
#[async_trait]
pub trait ServicesRegistry: Send + Sync {
    fn database_server_info(&self) -> &DatabaseServerInfo;

    async fn db_exists(&self, db_name: &str) -> Result<bool, RuntimeError>;

    async fn remove_db(&self, db_name: &str) -> Result<(), RuntimeError>;

    async fn user_exists(&self, user: &str) -> Result<bool, RuntimeError>;

    /// 删除用户在所有 host 上的账号
    async fn remove_user(&self, user: &str) -> Result<(), RuntimeError>;
}

/// 通过共享服务 compose 中的 mysql 客户端操作数据库
pub struct ComposeServicesRegistry {
    runtime: Arc<dyn ComposeRuntime>,
    compose_path: PathBuf,
    info: DatabaseServerInfo,
}

impl ComposeServicesRegistry {
    /// 从共享服务目录加载连接信息
    ///
    /// root 密码存放在 `<services_root>/secrets/db_root_password.txt`
    pub async fn load(runtime: Arc<dyn ComposeRuntime>, services_root: &Path) -> Self {
        let secret_path = services_root.join("secrets").join("db_root_password.txt");
        let password = match tokio::fs::read_to_string(&secret_path).await {
            Ok(password) => password.trim().to_string(),
            Err(e) => {
                warn!(path = %secret_path.display(), error = %e, "Database root password not readable");
                String::new()
            }
        };

        Self {
            runtime,
            compose_path: services_root.join("docker-compose.yml"),
            info: DatabaseServerInfo {
                host: DATABASE_SERVICE.to_string(),
                port: 3306,
                user: "root".to_string(),
                password,
                secret_path,
            },
        }
    }

    async fn query(&self, sql: &str) -> Result<String, RuntimeError> {
        let command = format!(
            "MYSQL_PWD={} mysql -u{} -N -B -e {}",
            shell_quote(&self.info.password),
            self.info.user,
            shell_quote(sql)
        );
        let output = self
            .runtime
            .exec(&self.compose_path, DATABASE_SERVICE, &command, &ExecOptions::default())
            .await?;

        if !output.success() {
            return Err(RuntimeError::CommandFailed {
                action: "mysql".to_string(),
                compose: self.compose_path.clone(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ServicesRegistry for ComposeServicesRegistry {
    fn database_server_info(&self) -> &DatabaseServerInfo {
        &self.info
    }

    async fn db_exists(&self, db_name: &str) -> Result<bool, RuntimeError> {
        let sql = format!(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {}",
            sql_string(db_name)
        );
        Ok(!self.query(&sql).await?.trim().is_empty())
    }

    async fn remove_db(&self, db_name: &str) -> Result<(), RuntimeError> {
        self.query(&format!("DROP DATABASE IF EXISTS {}", sql_identifier(db_name)))
            .await?;
        Ok(())
    }

    async fn user_exists(&self, user: &str) -> Result<bool, RuntimeError> {
        let sql = format!("SELECT User FROM mysql.user WHERE User = {}", sql_string(user));
        Ok(!self.query(&sql).await?.trim().is_empty())
    }

    async fn remove_user(&self, user: &str) -> Result<(), RuntimeError> {
        let sql = format!("SELECT Host FROM mysql.user WHERE User = {}", sql_string(user));
        let hosts = self.query(&sql).await?;
        for host in hosts.lines().map(str::trim).filter(|h| !h.is_empty()) {
            self.query(&format!(
                "DROP USER IF EXISTS {}@{}",
                sql_string(user),
                sql_string(host)
            ))
            .await?;
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', r"\\").replace('\'', r"\'"))
}

fn sql_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}
