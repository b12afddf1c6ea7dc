//! VS Code 附加到容器所需的配置

use serde_json::{json, Value};

/// 附加到容器后的编辑器设置
pub fn settings_json() -> Value {
    json!({
        "python.defaultInterpreterPath": "/workspace/frappe-bench/env/bin/python",
        "python.formatting.provider": "black",
        "python.formatting.blackPath": "/workspace/frappe-bench/env/bin/black",
        "debug.node.autoAttach": "disabled"
    })
}

pub fn tasks_json() -> Value {
    json!({
        "version": "2.0.0",
        "tasks": [{
            "label": "Stop Frappe Server",
            "type": "shell",
            "command": "supervisorctl -c /opt/user/supervisord.conf stop all"
        }, {
            "label": "Start Frappe Server",
            "type": "shell",
            "command": "supervisorctl -c /opt/user/supervisord.conf start all"
        }]
    })
}

pub fn launch_json() -> Value {
    json!({
        "version": "0.2.0",
        "configurations": [{
            "name": "Bench Web",
            "type": "debugpy",
            "request": "launch",
            "program": "${workspaceFolder}/frappe-bench/apps/frappe/frappe/utils/bench_helper.py",
            "args": ["frappe", "serve", "--port", "80", "--noreload", "--nothreading"],
            "cwd": "${workspaceFolder}/frappe-bench/sites",
            "env": { "DEV_SERVER": "1" },
            "preLaunchTask": "Stop Frappe Server",
            "postDebugTask": "Start Frappe Server"
        }]
    })
}

/// `devcontainer.metadata` 标签内容
pub fn devcontainer_metadata(user: &str, extensions: &[String]) -> Value {
    let mut extensions = extensions.to_vec();
    extensions.sort();
    json!([{
        "remoteUser": user,
        "remoteEnv": { "SHELL": "/bin/zsh" },
        "customizations": {
            "vscode": {
                "settings": settings_json(),
                "extensions": extensions
            }
        }
    }])
}

/// 标签中记录的扩展列表，解析失败视为空
pub fn metadata_extensions(label: Option<&str>) -> Vec<String> {
    label
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| {
            v.get(0)?
                .get("customizations")?
                .get("vscode")?
                .get("extensions")?
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(String::from))
                        .collect()
                })
        })
        .unwrap_or_default()
}

/// 标签中记录的远程用户
pub fn metadata_user(label: Option<&str>) -> Option<String> {
    let value: Value = serde_json::from_str(label?).ok()?;
    value.get(0)?.get("remoteUser")?.as_str().map(String::from)
}

/// 容器名的十六进制编码（`vscode-remote://attached-container+<hex>` 使用）
pub fn container_name_hex(container: &str) -> String {
    container.bytes().map(|b| format!("{:02x}", b)).collect()
}
