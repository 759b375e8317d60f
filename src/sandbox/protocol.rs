//! Worker 线协议
//!
//! 每个请求/响应各占一行 JSON：
//! - 请求 `{"code": <base64>, "workdir": <string>}`
//! - 响应 `{"status": "ok"|"error", "output": <string>, "error": <string>}`

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::core::PoolError;

/// 发给 worker 的一行请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// base64 编码的代码
    pub code: String,
    pub workdir: String,
}

impl WorkerRequest {
    pub fn new(code: &str, workdir: &Path) -> Self {
        Self {
            code: STANDARD.encode(code.as_bytes()),
            workdir: workdir.to_string_lossy().into_owned(),
        }
    }

    /// 序列化为以换行结尾的一行
    pub fn to_line(&self) -> Result<String, PoolError> {
        let mut line = serde_json::to_string(self).map_err(|e| PoolError::Encode(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
}

/// worker 返回的一行响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
}

impl WorkerResponse {
    pub fn parse(line: &str) -> Result<Self, PoolError> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| PoolError::Transport(format!("invalid worker response: {}", e)))
    }

    /// 非 ok 时把错误文本追加在已捕获输出之后
    pub fn into_result(self) -> Result<String, PoolError> {
        match self.status {
            JobStatus::Ok => Ok(self.output),
            JobStatus::Error => Err(PoolError::Execution {
                output: format!("{}\n{}", self.output, self.error),
                error: self.error,
            }),
        }
    }
}

/// 常驻 worker 脚本：逐行读请求，切换工作目录后执行代码并捕获 stdout/stderr
pub const WORKER_SCRIPT: &str = r#"
import sys
import os
import json
import base64
import traceback
import io
from contextlib import redirect_stdout, redirect_stderr

try:
    import matplotlib
    matplotlib.use('Agg')
    import matplotlib.pyplot as plt
except ImportError:
    pass

try:
    import pandas as pd
except ImportError:
    pass

try:
    import numpy as np
except ImportError:
    pass


def handle(line):
    req = json.loads(line)
    code = base64.b64decode(req['code']).decode('utf-8')
    workdir = req.get('workdir') or ''
    original_dir = os.getcwd()
    buf = io.StringIO()
    status, err = 'ok', ''
    try:
        if workdir:
            os.makedirs(workdir, exist_ok=True)
            os.chdir(workdir)
        with redirect_stdout(buf), redirect_stderr(buf):
            try:
                exec(code, {'__name__': '__main__'})
            except BaseException:
                status, err = 'error', traceback.format_exc()
    finally:
        os.chdir(original_dir)
    return {'status': status, 'output': buf.getvalue(), 'error': err}


while True:
    line = sys.stdin.readline()
    if not line:
        break
    if not line.strip():
        continue
    try:
        resp = handle(line)
    except Exception:
        resp = {'status': 'error', 'output': '', 'error': traceback.format_exc()}
    sys.stdout.write(json.dumps(resp) + '\n')
    sys.stdout.flush()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_carries_base64_code() {
        let req = WorkerRequest::new("print('你好')", Path::new("/tmp/session"));
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        let decoded = STANDARD.decode(value["code"].as_str().unwrap()).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "print('你好')");
        assert_eq!(value["workdir"], "/tmp/session");
    }

    #[test]
    fn test_error_response_appends_error_text() {
        let resp = WorkerResponse::parse(r#"{"status":"error","output":"partial","error":"NameError: x"}"#).unwrap();
        match resp.into_result() {
            Err(PoolError::Execution { output, error }) => {
                assert_eq!(output, "partial\nNameError: x");
                assert_eq!(error, "NameError: x");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_response_is_transport_error() {
        assert!(matches!(
            WorkerResponse::parse("Traceback (most recent call last):"),
            Err(PoolError::Transport(_))
        ));
    }
}
