use serde_json::{Value, json};

pub const START: &str = "download:start";
pub const PAUSE: &str = "download:pause";
pub const RESUME: &str = "download:resume";
pub const CANCEL: &str = "download:cancel";
pub const GET_ALL: &str = "download:getAll";
pub const CLEAR: &str = "download:clear";
pub const DESCRIBE: &str = "download:describe";

fn task_id_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "taskId": {
                "type": "string",
                "description": description
            }
        },
        "required": ["taskId"]
    })
}

/// 控制接口支持的方法及参数说明
pub fn get_method_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": START,
            "description": "创建下载任务并异步开始传输",
            "params": {
                "type": "object",
                "properties": {
                    "kind": {
                        "type": "string",
                        "description": "传输类型",
                        "enum": ["swarm", "extraction"]
                    },
                    "sourceDescriptor": {
                        "type": "string",
                        "description": "磁力链接 / 种子路径 / 媒体页面 URL"
                    },
                    "id": {
                        "type": "string",
                        "description": "任务ID，省略时自动生成"
                    },
                    "displayName": {
                        "type": "string",
                        "description": "展示名称"
                    },
                    "destinationDirectoryOverride": {
                        "type": "string",
                        "description": "保存目录，省略时使用默认下载目录"
                    },
                    "qualityHint": {
                        "description": "清晰度上限，仅 extraction 使用",
                        "oneOf": [
                            { "type": "string", "enum": ["360p", "480p", "720p", "1080p", "1440p", "4k"] },
                            {
                                "type": "object",
                                "properties": {
                                    "width": { "type": "integer" },
                                    "height": { "type": "integer" }
                                },
                                "required": ["width", "height"]
                            }
                        ]
                    },
                    "audioOnly": {
                        "type": "boolean",
                        "description": "只下载音频，仅 extraction 使用",
                        "default": false
                    }
                },
                "required": ["kind", "sourceDescriptor"]
            }
        }),
        json!({
            "name": PAUSE,
            "description": "暂停下载（swarm 不支持；extraction 为尽力而为）",
            "params": task_id_schema("要暂停的任务ID")
        }),
        json!({
            "name": RESUME,
            "description": "恢复已暂停的下载",
            "params": task_id_schema("要恢复的任务ID")
        }),
        json!({
            "name": CANCEL,
            "description": "取消并移除下载任务",
            "params": task_id_schema("要取消的任务ID")
        }),
        json!({
            "name": GET_ALL,
            "description": "按创建顺序列出所有任务",
            "params": { "type": "object", "properties": {} }
        }),
        json!({
            "name": CLEAR,
            "description": "移除已完成和出错的任务",
            "params": { "type": "object", "properties": {} }
        }),
        json!({
            "name": DESCRIBE,
            "description": "列出可用方法和各传输的能力",
            "params": { "type": "object", "properties": {} }
        }),
    ]
}
