//! JavaScript evaluated in the page by [`super::CdpDocument`]
//!
//! Every expression evaluates to a JSON string so results decode the same way
//! regardless of how CDP represents `null` or `undefined`.

use super::{EventKind, MenuSpec};

/// Name of the `Runtime.addBinding` function the page calls into
pub const BINDING_NAME: &str = "__portalAutomationEmit";

/// Installs the event bridge. Idempotent, safe to run on every new document.
/// Documents still parsing report `loaded` once `DOMContentLoaded` fires; a
/// document that is already loaded when the bridge arrives reports nothing.
pub const BRIDGE: &str = r#"
(() => {
    if (window.__portalAutomation) return;
    const emit = (payload) => {
        try {
            window.__portalAutomationEmit(JSON.stringify(payload));
        } catch (e) {
            console.warn('portal automation bridge unavailable', e);
        }
    };
    const observers = new Map();
    let nextId = 1;
    window.__portalAutomation = {
        emit,
        observe(selector) {
            const scope = document.querySelector(selector);
            if (!scope) return null;
            const id = nextId++;
            const observer = new MutationObserver((records) => {
                emit({ kind: 'mutations', observer: id, records: records.length });
            });
            observer.observe(scope, { childList: true, subtree: true });
            observers.set(id, observer);
            return id;
        },
        disconnect(id) {
            const observer = observers.get(id);
            if (observer) {
                observer.disconnect();
                observers.delete(id);
            }
            return true;
        },
    };
    window.addEventListener('popstate', () => emit({ kind: 'navigated' }));
    if (document.readyState === 'loading') {
        document.addEventListener('DOMContentLoaded', () => {
            emit({ kind: 'loaded', url: window.location.href });
        }, { once: true });
    }
})();
"#;

/// JS string literal for `value`
fn literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn wrap(body: &str) -> String {
    format!("JSON.stringify((() => {{ {body} }})())")
}

pub fn query(selector: &str) -> String {
    wrap(&format!(
        "const el = document.querySelector({sel});
         if (!el) return null;
         const hasValue = el instanceof HTMLInputElement
             || el instanceof HTMLTextAreaElement
             || el instanceof HTMLSelectElement;
         return {{
             tag: el.tagName.toLowerCase(),
             text: el.textContent || '',
             value: hasValue ? String(el.value) : null,
         }};",
        sel = literal(selector)
    ))
}

pub fn dispatch(selector: &str, event: EventKind) -> String {
    let constructor = if event.is_mouse() { "MouseEvent" } else { "Event" };
    wrap(&format!(
        "const el = document.querySelector({sel});
         if (!el) return false;
         el.dispatchEvent(new {constructor}({name}, {{ bubbles: true, cancelable: true }}));
         return true;",
        sel = literal(selector),
        name = literal(event.name()),
    ))
}

pub fn write_native_value(selector: &str, value: &str) -> String {
    wrap(&format!(
        "const el = document.querySelector({sel});
         if (!el) return {{ found: false }};
         const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
             : el instanceof HTMLInputElement ? HTMLInputElement.prototype
             : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
             : null;
         const descriptor = proto && Object.getOwnPropertyDescriptor(proto, 'value');
         if (!descriptor || typeof descriptor.set !== 'function') {{
             return {{ found: true, error: 'no value setter on <' + el.tagName.toLowerCase() + '> prototype' }};
         }}
         descriptor.set.call(el, {value});
         return {{ found: true }};",
        sel = literal(selector),
        value = literal(value),
    ))
}

pub fn toggle_class(selector: &str, class: &str, present: bool) -> String {
    wrap(&format!(
        "const el = document.querySelector({sel});
         if (!el) return false;
         el.classList.toggle({class}, {present});
         return true;",
        sel = literal(selector),
        class = literal(class),
    ))
}

pub fn mount_trigger(id: &str, label: &str) -> String {
    wrap(&format!(
        "const id = {id};
         if (document.getElementById(id)) return true;
         const style = document.createElement('style');
         style.textContent = '#' + id + ' {{ position: fixed; bottom: 20px; right: 20px; z-index: 1000; cursor: pointer; }}'
             + ' #' + id + '.hidden {{ display: none; }}';
         document.head.appendChild(style);
         const button = document.createElement('button');
         button.id = id;
         button.type = 'button';
         button.textContent = {label};
         button.addEventListener('click', () => window.__portalAutomation.emit({{ kind: 'trigger', id }}));
         document.body.appendChild(button);
         return true;",
        id = literal(id),
        label = literal(label),
    ))
}

/// Context menu installer, called with the serialized [`MenuSpec`]. Keeps the
/// menu and its listeners in `__portalAutomation.menus` so it can be shown
/// and unmounted by id.
const MOUNT_MENU: &str = r#"(spec) => {
    const bridge = window.__portalAutomation;
    bridge.menus = bridge.menus || {};
    if (bridge.menus[spec.id]) return true;

    const menu = document.createElement('div');
    menu.id = spec.id;
    menu.style.cssText = 'position: absolute; display: none; z-index: 10001;';
    for (const item of spec.items) {
        const entry = document.createElement('div');
        entry.dataset.item = item.id;
        entry.textContent = item.label;
        entry.style.cursor = 'pointer';
        entry.addEventListener('click', () => {
            bridge.emit({ kind: 'menuitem', menu: spec.id, item: item.id });
        });
        menu.appendChild(entry);
    }
    document.body.appendChild(menu);

    const patterns = spec.capture_patterns.map((source) => new RegExp(source));
    const origin = { x: 0, y: 0, anchor: null };
    const closest = (target, selector) =>
        target && typeof target.closest === 'function' ? target.closest(selector) : null;
    const textOf = (event) => {
        let text = String(window.getSelection() || '').trim();
        if (!text && spec.fallback) {
            const cell = closest(event.target, spec.fallback.cell);
            const value = cell && cell.querySelector(spec.fallback.value);
            if (value) text = (value.textContent || '').trim();
        }
        return text;
    };
    const onContextMenu = (event) => {
        const text = textOf(event);
        if (!text || !patterns.some((pattern) => pattern.test(text))) return;
        event.preventDefault();
        event.stopPropagation();
        if (menu.style.display === 'block') return;
        origin.x = event.pageX;
        origin.y = event.pageY;
        origin.anchor = spec.anchor ? closest(event.target, spec.anchor) : null;
        bridge.emit({ kind: 'menu', menu: spec.id, text });
    };
    const onClick = () => {
        menu.style.display = 'none';
    };
    document.addEventListener('contextmenu', onContextMenu, { capture: true, passive: false });
    document.addEventListener('click', onClick);

    bridge.menus[spec.id] = {
        show(items) {
            const anchor = origin.anchor;
            if (anchor) {
                anchor.appendChild(menu);
                const rect = anchor.getBoundingClientRect();
                menu.style.left = (origin.x - rect.left + (anchor.scrollLeft || 0)) + 'px';
                menu.style.top = (origin.y - rect.top + (anchor.scrollTop || 0)) + 'px';
            } else {
                document.body.appendChild(menu);
                menu.style.left = origin.x + 'px';
                menu.style.top = origin.y + 'px';
            }
            for (const entry of menu.children) {
                entry.style.display = items.includes(entry.dataset.item) ? 'block' : 'none';
            }
            menu.style.display = 'block';
            return true;
        },
        unmount() {
            document.removeEventListener('contextmenu', onContextMenu, { capture: true });
            document.removeEventListener('click', onClick);
            menu.remove();
            delete bridge.menus[spec.id];
            return true;
        },
    };
    return true;
}"#;

pub fn mount_menu(spec: &MenuSpec) -> String {
    let spec = serde_json::to_string(spec).unwrap_or_else(|_| "null".to_string());
    format!("JSON.stringify(({MOUNT_MENU})({spec}))")
}

fn menu_call(menu: &str, call: &str) -> String {
    wrap(&format!(
        "const menus = window.__portalAutomation.menus || {{}};
         const menu = menus[{id}];
         return menu ? menu.{call} : false;",
        id = literal(menu),
    ))
}

pub fn show_menu(menu: &str, items: &[String]) -> String {
    let items = serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string());
    menu_call(menu, &format!("show({items})"))
}

pub fn unmount_menu(menu: &str) -> String {
    menu_call(menu, "unmount()")
}

/// Evaluated as a user gesture so the popup blocker treats it like a click
pub fn open_tab(url: &str) -> String {
    wrap(&format!(
        "const tab = window.open({url}, '_blank');
         if (!tab) return false;
         tab.blur();
         window.focus();
         return true;",
        url = literal(url),
    ))
}

pub fn remove(selector: &str) -> String {
    wrap(&format!(
        "const el = document.querySelector({sel});
         if (!el) return false;
         el.remove();
         return true;",
        sel = literal(selector)
    ))
}

pub fn set_title(title: &str) -> String {
    wrap(&format!("document.title = {}; return true;", literal(title)))
}

pub fn alert(message: &str) -> String {
    // Deferred so the evaluation returns before the dialog blocks the page.
    wrap(&format!(
        "setTimeout(() => window.alert({}), 0); return true;",
        literal(message)
    ))
}

pub fn observe(scope: &str) -> String {
    wrap(&format!(
        "return window.__portalAutomation.observe({});",
        literal(scope)
    ))
}

pub fn disconnect(observer: u64) -> String {
    wrap(&format!(
        "return window.__portalAutomation.disconnect({observer});"
    ))
}

pub const TITLE: &str = "JSON.stringify(document.title)";

pub const LOCATION: &str = "JSON.stringify(window.location.href)";
