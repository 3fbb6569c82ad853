use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::registry::{
    TOOL_CHAT, TOOL_IMAGE_ANALYSIS, TOOL_NUTRITION_ADVICE, TOOL_SEND_EMAIL, TOOL_SETUP_REQUIRED,
};
use crate::llm::{CompletionBackend, CompletionRequest};
use crate::notifications::{NotificationDraft, NotificationLog};
use crate::protocol::{CODE_INTERNAL_ERROR, CODE_INVALID_PARAMS, CODE_METHOD_NOT_FOUND};

const TEMPERATURE: f32 = 0.7;
const CHAT_MAX_TOKENS: u32 = 600;
const ADVICE_MAX_TOKENS: u32 = 700;
const IMAGE_MAX_TOKENS: u32 = 800;

const AUDIENCE_NOTE: &str = "El usuario son personas fitness/wellness de 18-35 años que quieren cumplir sus objetivos de salud.";
const CONVERSATIONAL_FORMAT: &str = "IMPORTANTE: Usa un formato natural y amigable con emojis. Para planes de comida, usa formato conversacional como \"🌅 Para el desayuno te recomiendo...\" en lugar de listas con asteriscos o markdown.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub code: i64,
    pub message: String,
}

impl ToolError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, format!("Método no encontrado: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(CODE_INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for ToolError {}

#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub chat: String,
    pub vision: String,
}

/// Runs one tool body. Holds the process-lifetime collaborators only.
pub struct ToolExecutor {
    completions: Option<Arc<dyn CompletionBackend>>,
    notifications: Arc<NotificationLog>,
    models: ModelSelection,
}

impl ToolExecutor {
    pub fn new(
        completions: Option<Arc<dyn CompletionBackend>>,
        notifications: Arc<NotificationLog>,
        models: ModelSelection,
    ) -> Self {
        Self {
            completions,
            notifications,
            models,
        }
    }

    pub fn has_completions(&self) -> bool {
        self.completions.is_some()
    }

    pub async fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        match name {
            TOOL_SETUP_REQUIRED => Ok(text_content(SETUP_INSTRUCTIONS)),
            TOOL_CHAT => self.chat(args).await,
            TOOL_NUTRITION_ADVICE => self.nutrition_advice(args).await,
            TOOL_IMAGE_ANALYSIS => self.image_analysis(args).await,
            TOOL_SEND_EMAIL => Ok(self.send_email(args).await),
            other => Err(ToolError::internal(format!("Herramienta no encontrada: {other}"))),
        }
    }

    async fn chat(&self, args: &Value) -> Result<Value, ToolError> {
        let message = required_text(args, "message")?;
        let profile = UserProfile::from_args(args);
        let mut system = format!(
            "Eres nutrIA, una IA especializada en nutrición y salud. Proporciona consejos útiles y personalizados. {CONVERSATIONAL_FORMAT} {AUDIENCE_NOTE}"
        );
        system.push_str(&profile.prompt_section("Información del usuario"));
        let text = self
            .complete(
                &self.models.chat,
                vec![
                    json!({ "role": "system", "content": system }),
                    json!({ "role": "user", "content": message }),
                ],
                CHAT_MAX_TOKENS,
                "Error generando respuesta",
            )
            .await?;
        Ok(text_content(text))
    }

    async fn nutrition_advice(&self, args: &Value) -> Result<Value, ToolError> {
        let question = required_text(args, "question")?;
        let profile = UserProfile::from_args(args);
        let mut system = format!(
            "Eres nutrIA. Proporciona consejos específicos de nutrición con recomendaciones prácticas. {CONVERSATIONAL_FORMAT} {AUDIENCE_NOTE}"
        );
        system.push_str(&profile.prompt_section("Perfil del usuario"));
        let text = self
            .complete(
                &self.models.chat,
                vec![
                    json!({ "role": "system", "content": system }),
                    json!({ "role": "user", "content": question }),
                ],
                ADVICE_MAX_TOKENS,
                "Error generando respuesta",
            )
            .await?;
        Ok(text_content(text))
    }

    async fn image_analysis(&self, args: &Value) -> Result<Value, ToolError> {
        let image = required_text(args, "imageData")
            .map_err(|_| ToolError::invalid_params("No se proporcionó imagen para analizar"))?;
        let image_url = normalize_image_url(&image)?;
        let image_name = optional_text(args, "imageName").unwrap_or_else(|| "imagen".to_owned());
        debug!("analyzing image {image_name} ({} bytes)", image.len());

        let profile = UserProfile::from_args(args);
        let mut system = format!(
            "Eres nutrIA, especialista en nutrición. Analiza esta imagen de comida y proporciona información detallada sobre los macronutrientes. Debes calcular cantidades aproximadas y dar información nutricional específica. IMPORTANTE: NO uses asteriscos ni markdown. Usa emojis y formato de tabla simple. Estructura tu respuesta con emojis para categorías y presenta los valores nutricionales en formato de tabla con líneas simples. {AUDIENCE_NOTE}"
        );
        system.push_str(&profile.prompt_section("Perfil del usuario"));
        match profile.goal.as_deref() {
            Some(goal) => {
                system.push_str(&format!("\n• Objetivo: {goal}"));
                system.push_str("\n\nIMPORTANTE: Evalúa si este alimento es apropiado para el objetivo del usuario. Asigna una calificación del 1 al 10 sobre qué tan bien se alinea con su objetivo. Tu respuesta debe terminar con: \"Calificación para tu objetivo [objetivo]: [X]/10. Perfecto, registro este alimento en tu seguimiento.\"");
            }
            None => system.push_str(
                "\n\nTu respuesta debe terminar con: \"Perfecto, registro este alimento en tu seguimiento.\"",
            ),
        }
        system.push_str(IMAGE_FORMAT_EXAMPLE);

        let instruction = format!(
            "Analiza esta imagen de comida y calcula los macronutrientes (proteínas, carbohidratos, grasas, calorías). Presenta la información nutricional en formato de tabla con emojis, sin usar asteriscos ni markdown{}",
            if profile.goal.is_some() {
                " y evalúa qué tan apropiado es para mi objetivo."
            } else {
                "."
            }
        );
        let text = self
            .complete(
                &self.models.vision,
                vec![
                    json!({ "role": "system", "content": system }),
                    json!({
                        "role": "user",
                        "content": [
                            { "type": "text", "text": instruction },
                            { "type": "image_url", "image_url": { "url": image_url } }
                        ]
                    }),
                ],
                IMAGE_MAX_TOKENS,
                "Error analizando imagen",
            )
            .await?;
        Ok(text_content(text))
    }

    async fn send_email(&self, args: &Value) -> Value {
        let validation = args
            .get("isValidation")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let nutritionist = args
            .pointer("/nutritionist/name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned);

        let receipt = self
            .notifications
            .record(NotificationDraft {
                to: optional_text(args, "to"),
                subject: optional_text(args, "subject"),
                message: optional_text(args, "message"),
                user_profile: args.get("userProfile").cloned().unwrap_or(Value::Null),
                validation,
            })
            .await;
        info!(
            "notification {} recorded via {}",
            receipt.entry.id,
            receipt.method.as_str()
        );

        let entry = &receipt.entry;
        let recipient = nutritionist.clone().unwrap_or_else(|| entry.to.clone());
        let responder = nutritionist.unwrap_or_else(|| "tu nutricionista".to_owned());
        let body = if validation {
            "📝 Se ha enviado tu solicitud de validación junto con el contexto de la conversación."
        } else {
            "📝 Tu mensaje ha sido enviado y deberías recibir una respuesta pronto."
        };
        text_content(format!(
            "✅ Notificación enviada exitosamente a {recipient}\n\n📧 Asunto: {}\n{body}\n\n🔔 Te notificaremos cuando {responder} responda.\n\n📬 ID: {}",
            entry.subject, entry.id
        ))
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<Value>,
        max_tokens: u32,
        empty_fallback: &str,
    ) -> Result<String, ToolError> {
        let Some(backend) = self.completions.as_ref() else {
            return Err(ToolError::internal("OpenAI no configurado"));
        };
        let text = backend
            .complete(CompletionRequest {
                model: model.to_owned(),
                messages,
                max_tokens,
                temperature: TEMPERATURE,
            })
            .await
            .map_err(|err| {
                warn!("completion call failed: {err:#}");
                ToolError::internal(format!("{err:#}"))
            })?;
        if text.trim().is_empty() {
            return Ok(empty_fallback.to_owned());
        }
        Ok(text)
    }
}

pub fn text_content(text: impl Into<String>) -> Value {
    json!({ "content": [{ "type": "text", "text": text.into() }] })
}

const SETUP_INSTRUCTIONS: &str = "🔧 Para usar nutrIA necesitas configurar OpenAI.\n\n📋 Pasos:\n1. Define OPENAI_API_KEY o llm.api_key en nutria.toml\n2. Comprueba la configuración con: nutria-relay doctor\n3. Reinicia la aplicación\n\n💡 Una vez configurado tendrás acceso completo a nutrIA!";

const IMAGE_FORMAT_EXAMPLE: &str = "\n\nEjemplo de formato deseado:\n🍎 Mix Patagónico (40g)\n\n📊 Información Nutricional:\n────────────────────────\n🔥 Calorías │ 200-250 kcal\n🥩 Proteínas │ 4-6 g\n🍞 Carbohidratos │ 20-25 g\n🧈 Grasas │ 12-15 g\n────────────────────────";

#[derive(Debug, Default, Clone, PartialEq)]
struct UserProfile {
    name: Option<String>,
    age: Option<f64>,
    weight: Option<f64>,
    height: Option<f64>,
    goal: Option<String>,
}

impl UserProfile {
    fn from_args(args: &Value) -> Self {
        let Some(profile) = args.get("userProfile").filter(|value| value.is_object()) else {
            return Self::default();
        };
        Self {
            name: text_field(profile, "name"),
            age: number_field(profile, "age"),
            weight: number_field(profile, "weight"),
            height: number_field(profile, "height"),
            goal: text_field(profile, "objetivo"),
        }
    }

    fn bmi(&self) -> Option<f64> {
        let (weight, height) = (self.weight?, self.height?);
        Some(weight / (height * height))
    }

    fn prompt_section(&self, heading: &str) -> String {
        if self.name.is_none() && self.age.is_none() && self.weight.is_none() && self.height.is_none()
        {
            return String::new();
        }
        let mut section = format!("\n\n{heading}:");
        if let Some(name) = &self.name {
            section.push_str(&format!("\n• Nombre: {name}"));
        }
        if let Some(age) = self.age {
            section.push_str(&format!("\n• Edad: {} años", display_number(age)));
        }
        if let Some(weight) = self.weight {
            section.push_str(&format!("\n• Peso: {} kg", display_number(weight)));
        }
        if let Some(height) = self.height {
            section.push_str(&format!("\n• Altura: {} m", display_number(height)));
        }
        if let Some(bmi) = self.bmi() {
            section.push_str(&format!("\n• IMC: {bmi:.1}"));
        }
        section
    }
}

fn text_field(profile: &Value, key: &str) -> Option<String> {
    profile
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

/// Positive number, given either as JSON number or numeric string.
fn number_field(profile: &Value, key: &str) -> Option<f64> {
    let value = match profile.get(key)? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => text.trim().replace(',', ".").parse::<f64>().ok()?,
        _ => return None,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

fn display_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn required_text(args: &Value, key: &str) -> Result<String, ToolError> {
    optional_text(args, key)
        .ok_or_else(|| ToolError::invalid_params(format!("missing required argument: {key}")))
}

fn optional_text(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

/// Data URLs and http(s) URLs pass through once their payload checks out;
/// bare base64 becomes a JPEG data URL.
fn normalize_image_url(image: &str) -> Result<String, ToolError> {
    let lower = image.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(image.to_owned());
    }
    if lower.starts_with("data:") {
        let Some((header, payload)) = image.split_once(',') else {
            return Err(ToolError::invalid_params("imageData is not a valid data URL"));
        };
        if header.to_ascii_lowercase().ends_with(";base64") {
            decode_base64(payload)?;
        }
        return Ok(image.to_owned());
    }
    decode_base64(image)?;
    Ok(format!("data:image/jpeg;base64,{image}"))
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, ToolError> {
    let compact = payload
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect::<String>();
    BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| ToolError::invalid_params(format!("imageData is not valid base64: {err}")))
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::stub::RecordingBackend;
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("nutria-tools-{}", uuid::Uuid::new_v4().simple()))
    }

    fn executor(backend: Option<Arc<RecordingBackend>>, dir: PathBuf) -> ToolExecutor {
        ToolExecutor::new(
            backend.map(|backend| backend as Arc<dyn CompletionBackend>),
            Arc::new(NotificationLog::new(dir)),
            ModelSelection {
                chat: "gpt-4o-mini".to_owned(),
                vision: "gpt-4o".to_owned(),
            },
        )
    }

    fn first_text(result: &Value) -> &str {
        result["content"][0]["text"].as_str().unwrap_or_default()
    }

    #[tokio::test]
    async fn chat_prompt_includes_profile_and_bmi() {
        let backend = Arc::new(RecordingBackend::replying("🥗 ¡Claro que sí!"));
        let tools = executor(Some(backend.clone()), scratch_dir());
        let result = tools
            .execute(
                TOOL_CHAT,
                &json!({
                    "message": "¿Qué ceno hoy?",
                    "userProfile": { "name": "Lucía", "age": 28, "weight": 60, "height": "1.65" }
                }),
            )
            .await
            .expect("chat result");
        assert_eq!(first_text(&result), "🥗 ¡Claro que sí!");

        let requests = backend.recorded();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.max_tokens, 600);
        let system = request.messages[0]["content"].as_str().unwrap_or_default();
        assert!(system.contains("Información del usuario:"));
        assert!(system.contains("• Nombre: Lucía"));
        assert!(system.contains("• Edad: 28 años"));
        assert!(system.contains("• Altura: 1.65 m"));
        assert!(system.contains("• IMC: 22.0"));
        assert_eq!(request.messages[1]["content"], "¿Qué ceno hoy?");
    }

    #[tokio::test]
    async fn advice_without_profile_omits_profile_section() {
        let backend = Arc::new(RecordingBackend::replying("   "));
        let tools = executor(Some(backend.clone()), scratch_dir());
        let result = tools
            .execute(TOOL_NUTRITION_ADVICE, &json!({ "question": "¿Proteína?" }))
            .await
            .expect("advice");
        assert_eq!(first_text(&result), "Error generando respuesta");
        let request = &backend.recorded()[0];
        assert_eq!(request.max_tokens, 700);
        let system = request.messages[0]["content"].as_str().unwrap_or_default();
        assert!(!system.contains("Perfil del usuario"));
    }

    #[tokio::test]
    async fn image_analysis_wraps_bare_base64_and_mentions_goal() {
        let backend = Arc::new(RecordingBackend::replying("🍎 Manzana (150g)"));
        let tools = executor(Some(backend.clone()), scratch_dir());
        tools
            .execute(
                TOOL_IMAGE_ANALYSIS,
                &json!({
                    "imageData": "aGVsbG8=",
                    "imageName": "manzana.jpg",
                    "userProfile": { "objetivo": "perder grasa" }
                }),
            )
            .await
            .expect("analysis");
        let request = &backend.recorded()[0];
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.max_tokens, 800);
        let system = request.messages[0]["content"].as_str().unwrap_or_default();
        assert!(system.contains("• Objetivo: perder grasa"));
        let parts = &request.messages[1]["content"];
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,aGVsbG8=");
        assert!(parts[0]["text"]
            .as_str()
            .unwrap_or_default()
            .ends_with("apropiado es para mi objetivo."));
    }

    #[tokio::test]
    async fn image_analysis_rejects_missing_or_invalid_image() {
        let backend = Arc::new(RecordingBackend::replying("unused"));
        let tools = executor(Some(backend.clone()), scratch_dir());
        let missing = tools
            .execute(TOOL_IMAGE_ANALYSIS, &json!({ "imageName": "x.jpg" }))
            .await
            .expect_err("missing image");
        assert_eq!(missing.code, CODE_INVALID_PARAMS);
        assert_eq!(missing.message, "No se proporcionó imagen para analizar");

        let invalid = tools
            .execute(
                TOOL_IMAGE_ANALYSIS,
                &json!({ "imageData": "data:image/png;base64,@@not-base64@@" }),
            )
            .await
            .expect_err("invalid image");
        assert_eq!(invalid.code, CODE_INVALID_PARAMS);
        assert!(backend.recorded().is_empty());
    }

    #[tokio::test]
    async fn missing_message_and_backend_failures_become_tool_errors() {
        let failing = Arc::new(RecordingBackend::failing("status=429 body=rate limited"));
        let tools = executor(Some(failing), scratch_dir());
        let missing = tools
            .execute(TOOL_CHAT, &json!({ "message": "  " }))
            .await
            .expect_err("missing message");
        assert_eq!(missing.code, CODE_INVALID_PARAMS);

        let upstream = tools
            .execute(TOOL_CHAT, &json!({ "message": "hola" }))
            .await
            .expect_err("upstream failure");
        assert_eq!(upstream.code, CODE_INTERNAL_ERROR);
        assert!(upstream.message.contains("rate limited"));

        let unconfigured = executor(None, scratch_dir());
        let err = unconfigured
            .execute(TOOL_CHAT, &json!({ "message": "hola" }))
            .await
            .expect_err("no backend");
        assert_eq!(err.message, "OpenAI no configurado");
    }

    #[tokio::test]
    async fn send_email_records_validation_entry() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let tools = executor(None, dir.clone());
        let result = tools
            .execute(
                TOOL_SEND_EMAIL,
                &json!({
                    "to": "dra.perez@example.com",
                    "subject": "Validar plan semanal",
                    "message": "Plan de 2000 kcal",
                    "nutritionist": { "name": "Dra. Pérez" },
                    "isValidation": true
                }),
            )
            .await
            .expect("send-email");
        let text = first_text(&result);
        assert!(text.starts_with("✅ Notificación enviada exitosamente a Dra. Pérez"));
        assert!(text.contains("solicitud de validación"));
        assert!(text.contains("📧 Asunto: Validar plan semanal"));

        let mut files = tokio::fs::read_dir(&dir).await?;
        let file = files.next_entry().await?.expect("daily file");
        let stored: Vec<Value> =
            serde_json::from_str(&tokio::fs::read_to_string(file.path()).await?)?;
        assert_eq!(stored[0]["type"], "validation");
        let id = stored[0]["id"].as_str().unwrap_or_default();
        assert!(text.ends_with(&format!("📬 ID: {id}")));

        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn setup_required_returns_static_instructions() {
        let tools = executor(None, scratch_dir());
        let result = tools
            .execute(TOOL_SETUP_REQUIRED, &json!({}))
            .await
            .expect("setup");
        assert!(first_text(&result).contains("OPENAI_API_KEY"));
    }

    #[test]
    fn profile_numbers_accept_strings_and_skip_non_positive() {
        let profile = UserProfile::from_args(&json!({
            "userProfile": { "weight": "72,5", "height": 0, "age": "treinta" }
        }));
        assert_eq!(profile.weight, Some(72.5));
        assert_eq!(profile.height, None);
        assert_eq!(profile.age, None);
        assert_eq!(profile.bmi(), None);
        assert_eq!(display_number(72.0), "72");
        assert_eq!(display_number(1.7), "1.7");
    }
}
